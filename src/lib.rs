// SPDX-License-Identifier: MPL-2.0

#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Two-helper aggregation of conversion reports.
//!
//! A client splits each conversion (a bucket key and a 16-bit value) into two partial reports,
//! one per helper. The helpers privately join the reports on their bucket keys, so that reports
//! with equal keys land in the same bucket without either helper learning a key. Each helper then
//! secret-shares its value share into the joined bucket with a distributed point function, expands
//! the DPF keys it holds into a partial histogram and optionally adds discrete Laplace noise. The
//! two partial histograms sum to the histogram of all reports.
//!
//! The pieces, bottom up:
//!
//! - [`secret_share`]: XOR and additive secret sharing.
//! - [`elgamal`]: ElGamal over Ristretto with commutative re-keying, the basis of the join.
//! - [`hpke`]: transport encryption of reports and DPF keys.
//! - [`report`]: splitting conversions into partial reports and opening them.
//! - [`join`]: the two-round private join.
//! - [`dpf`]: the incremental DPF and hierarchical expansion parameters.
//! - [`dp`]: noise.
//! - [`aggregator`]: key generation, expansion into partial histograms and release.
//! - [`pipeline`]: the helper actor and the batch entry point.

pub mod aggregator;
pub mod dp;
pub mod dpf;
pub mod elgamal;
pub mod error;
pub mod field;
pub mod hpke;
pub mod join;
pub mod keys;
pub mod message;
pub mod pipeline;
pub mod report;
pub mod secret_share;
pub mod xof;

pub use error::Error;
