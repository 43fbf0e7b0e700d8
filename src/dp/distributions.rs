// SPDX-License-Identifier: MPL-2.0

//! Noise distributions.

use super::{DifferentialPrivacyDistribution, DpError};
use rand::Rng;
use rand_distr::{Distribution, Geometric};

/// The discrete Laplace distribution with scale `t`: `P(x) ∝ exp(-|x| / t)` over the integers.
///
/// Samples are the difference of two independent geometric variables with success probability
/// `1 - exp(-1 / t)`.
#[derive(Clone, Copy, Debug)]
pub struct DiscreteLaplace {
    scale: f64,
    geometric: Geometric,
}

impl DiscreteLaplace {
    /// Create a discrete Laplace distribution with the given scale.
    pub fn new(scale: f64) -> Result<Self, DpError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(DpError::InvalidParameter(format!(
                "discrete Laplace scale must be positive and finite, got {scale}"
            )));
        }
        let success_probability = -(-1.0 / scale).exp_m1();
        let geometric = Geometric::new(success_probability)
            .map_err(|e| DpError::InvalidParameter(e.to_string()))?;
        Ok(Self { scale, geometric })
    }

    /// The scale parameter.
    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Distribution<i64> for DiscreteLaplace {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        let positive = self.geometric.sample(rng);
        let negative = self.geometric.sample(rng);
        if positive >= negative {
            i64::try_from(positive - negative).unwrap_or(i64::MAX)
        } else {
            i64::try_from(negative - positive).map_or(i64::MIN, |magnitude| -magnitude)
        }
    }
}

impl DifferentialPrivacyDistribution for DiscreteLaplace {}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn invalid_scale() {
        for scale in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert_matches!(
                DiscreteLaplace::new(scale),
                Err(DpError::InvalidParameter(_))
            );
        }
    }

    #[test]
    fn symmetric_around_zero() {
        let distribution = DiscreteLaplace::new(2.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<i64> = (0..20_000).map(|_| distribution.sample(&mut rng)).collect();
        let positive = samples.iter().filter(|x| **x > 0).count() as f64;
        let negative = samples.iter().filter(|x| **x < 0).count() as f64;
        assert!((positive - negative).abs() < 0.05 * samples.len() as f64);

        // P(0) = (1 - a) / (1 + a) with a = exp(-1/2).
        let a = (-0.5f64).exp();
        let zeros = samples.iter().filter(|x| **x == 0).count() as f64 / samples.len() as f64;
        assert!((zeros - (1.0 - a) / (1.0 + a)).abs() < 0.02, "P(0) = {zeros}");
    }
}
