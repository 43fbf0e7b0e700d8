// SPDX-License-Identifier: MPL-2.0

//! Differential privacy (DP) primitives.
//!
//! There are three main traits defined in this module:
//!
//!  - `DifferentialPrivacyBudget`: Implementors should be types of DP-budgets,
//!    i.e., methods to measure the amount of privacy provided by DP-mechanisms.
//!    Example: PureDP
//!
//!  - `DifferentialPrivacyDistribution`: Distribution from which noise is sampled.
//!    Example: DiscreteLaplace
//!
//!  - `DifferentialPrivacyStrategy`: This is a combination of choices for budget and distribution.
//!    Example: PureDP-DiscreteLaplace
//!
//! On top of these, [`NoiseSource`] is the single interface through which aggregation adds noise
//! to a helper's bucket sums. [`PrivacyParams::noise_source`] picks the discrete Laplace source, or
//! [`NoNoise`] when privacy is disabled.

use crate::field::Field64;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};

pub mod distributions;

use distributions::DiscreteLaplace;

/// Errors propagated by methods in this module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DpError {
    /// Tried to use an invalid float as privacy parameter.
    #[error(
        "DP error: input value was not a valid privacy parameter. \
             It should to be a non-negative, finite float."
    )]
    InvalidFloat,

    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Marker trait for differential privacy budgets (regardless of the specific accounting method).
pub trait DifferentialPrivacyBudget {}

/// Marker trait for differential privacy scalar noise distributions.
pub trait DifferentialPrivacyDistribution {}

/// Pure differential privacy budget. (&epsilon;-DP or (&epsilon;, 0)-DP)
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PureDpBudget {
    epsilon: f64,
}

impl PureDpBudget {
    /// Create a budget for parameter `epsilon`.
    pub fn new(epsilon: f64) -> Result<Self, DpError> {
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(DpError::InvalidFloat);
        }
        if epsilon == 0.0 {
            return Err(DpError::InvalidParameter("epsilon cannot be zero".into()));
        }
        Ok(Self { epsilon })
    }

    /// The budget's epsilon.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

impl DifferentialPrivacyBudget for PureDpBudget {}

impl<'de> Deserialize<'de> for PureDpBudget {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Helper {
            epsilon: f64,
        }

        let helper = Helper::deserialize(deserializer)?;
        PureDpBudget::new(helper.epsilon).map_err(serde::de::Error::custom)
    }
}

/// Strategy to make aggregate results differentially private, e.g. by adding noise from a specific
/// type of distribution instantiated with a given DP budget.
pub trait DifferentialPrivacyStrategy {
    /// The type of the DP budget, i.e. the variant of differential privacy that can be obtained
    /// by using this strategy.
    type Budget: DifferentialPrivacyBudget;

    /// The distribution type this strategy will use to generate the noise.
    type Distribution: DifferentialPrivacyDistribution;

    /// The type the sensitivity used for privacy analysis has.
    type Sensitivity;

    /// Create a strategy from a differential privacy budget. The distribution created with
    /// `create_distribution` should provide the amount of privacy specified here.
    fn from_budget(b: Self::Budget) -> Self;

    /// Create a new distribution parametrized s.t. adding samples to the result of a function
    /// with sensitivity `s` will yield differential privacy of the DP variant given in the
    /// `Budget` type. Can error upon invalid parameters.
    fn create_distribution(&self, s: Self::Sensitivity) -> Result<Self::Distribution, DpError>;
}

/// Pure DP via discrete Laplace noise with scale `sensitivity / epsilon`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PureDpDiscreteLaplace {
    budget: PureDpBudget,
}

impl DifferentialPrivacyStrategy for PureDpDiscreteLaplace {
    type Budget = PureDpBudget;
    type Distribution = DiscreteLaplace;
    type Sensitivity = u64;

    fn from_budget(budget: PureDpBudget) -> Self {
        Self { budget }
    }

    fn create_distribution(&self, s: u64) -> Result<DiscreteLaplace, DpError> {
        if s == 0 {
            return Err(DpError::InvalidParameter(
                "sensitivity cannot be zero".into(),
            ));
        }
        DiscreteLaplace::new(s as f64 / self.budget.epsilon)
    }
}

/// Privacy configuration of a release: the per-helper noise budget and the L1 sensitivity of a
/// single report's contribution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyParams {
    /// Privacy budget. Zero disables noise.
    pub epsilon: f64,
    /// Largest contribution of one report to a bucket sum.
    pub l1_sensitivity: u64,
}

impl Default for PrivacyParams {
    fn default() -> Self {
        Self {
            epsilon: 0.0,
            l1_sensitivity: 1 << 16,
        }
    }
}

impl PrivacyParams {
    /// Check that epsilon is finite and non-negative, and that the sensitivity is positive when
    /// noise is enabled.
    pub fn validate(&self) -> Result<(), DpError> {
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(DpError::InvalidFloat);
        }
        if self.epsilon > 0.0 && self.l1_sensitivity == 0 {
            return Err(DpError::InvalidParameter(
                "l1_sensitivity must be positive when epsilon is set".into(),
            ));
        }
        Ok(())
    }

    /// Whether these parameters call for noise.
    pub fn is_enabled(&self) -> bool {
        self.epsilon > 0.0
    }

    /// The noise source for these parameters, seeded from OS entropy. `ignore_privacy` selects
    /// [`NoNoise`] regardless of epsilon, for exact verification runs only.
    pub fn noise_source(&self, ignore_privacy: bool) -> Result<Box<dyn NoiseSource>, DpError> {
        self.validate()?;
        if ignore_privacy || !self.is_enabled() {
            return Ok(Box::new(NoNoise));
        }
        Ok(Box::new(DiscreteLaplaceNoise::new(
            *self,
            StdRng::from_entropy(),
        )?))
    }
}

/// Adds noise to a helper's share of the bucket sums.
pub trait NoiseSource {
    /// Add noise to each entry of `agg_share` in place.
    fn add_noise_to_agg_share(&mut self, agg_share: &mut [Field64]);

    /// The parameters the noise is calibrated to, or `None` if no noise is added.
    fn privacy(&self) -> Option<PrivacyParams>;
}

#[cfg(test)]
impl std::fmt::Debug for dyn NoiseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSource")
            .field("privacy", &self.privacy())
            .finish()
    }
}

/// A [`NoiseSource`] that adds nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoNoise;

impl NoiseSource for NoNoise {
    fn add_noise_to_agg_share(&mut self, _: &mut [Field64]) {}

    fn privacy(&self) -> Option<PrivacyParams> {
        None
    }
}

/// A [`NoiseSource`] sampling discrete Laplace noise with scale `l1_sensitivity / epsilon`.
#[derive(Debug)]
pub struct DiscreteLaplaceNoise<R> {
    params: PrivacyParams,
    distribution: DiscreteLaplace,
    rng: R,
}

impl<R: Rng> DiscreteLaplaceNoise<R> {
    /// Build the noise source for `params`, drawing samples from `rng`.
    pub fn new(params: PrivacyParams, rng: R) -> Result<Self, DpError> {
        params.validate()?;
        let strategy = PureDpDiscreteLaplace::from_budget(PureDpBudget::new(params.epsilon)?);
        Ok(Self {
            params,
            distribution: strategy.create_distribution(params.l1_sensitivity)?,
            rng,
        })
    }
}

impl<R: Rng> NoiseSource for DiscreteLaplaceNoise<R> {
    fn add_noise_to_agg_share(&mut self, agg_share: &mut [Field64]) {
        for entry in agg_share.iter_mut() {
            *entry += Field64::from_signed(self.distribution.sample(&mut self.rng));
        }
    }

    fn privacy(&self) -> Option<PrivacyParams> {
        Some(self.params)
    }
}
