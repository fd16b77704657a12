//! Resampling utilities and the bootstrap road tracking filter.
//!
//! Weights are handled in the log domain and normalized with the max-subtraction trick so a
//! fix far from every particle does not underflow to an all-zero weight vector; if it does
//! anyway the weights fall back to uniform.
use std::fmt::{self, Debug};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::Observation;
use crate::config::FilterParameters;
use crate::error::FilterError;
use crate::filter::{
    Child, FilterCommon, FilterContext, FilterKind, Hypothesis, RoadTrackingFilter,
};
use crate::road::RoadNetwork;
use crate::state::PosteriorDistribution;

/// Turn log weights into normalized weights. Non-finite or empty input yields uniform weights.
pub fn normalize_log_weights(log_weights: &[f64]) -> Vec<f64> {
    if log_weights.is_empty() {
        return Vec::new();
    }
    let max_log = log_weights
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    let uniform = vec![1.0 / log_weights.len() as f64; log_weights.len()];
    if !max_log.is_finite() {
        return uniform;
    }
    let mut weights: Vec<f64> = log_weights.iter().map(|l| (l - max_log).exp()).collect();
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        for w in &mut weights {
            *w /= sum;
        }
        weights
    } else {
        uniform
    }
}

/// `log(Σ exp(xᵢ))` without overflow.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Draw `n` indices with replacement, each with probability proportional to its weight.
pub fn multinomial_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let mut cdf = Vec::with_capacity(weights.len());
    let mut total = 0.0;
    for w in weights {
        if w.is_finite() && *w > 0.0 {
            total += w;
        }
        cdf.push(total);
    }
    if total <= 0.0 {
        cdf = (1..=weights.len()).map(|i| i as f64).collect();
        total = weights.len() as f64;
    }
    let last = weights.len() - 1;
    (0..n)
        .map(|_| {
            let u = rng.random::<f64>() * total;
            cdf.partition_point(|&c| c <= u).min(last)
        })
        .collect()
}

/// Multinomial draw summarized as a count per index; the counts sum to `n`.
pub fn multinomial_counts<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let mut counts = vec![0usize; weights.len()];
    for i in multinomial_resample(weights, n, rng) {
        counts[i] += 1;
    }
    counts
}

/// Bootstrap filter: each copy of a particle picks its move from the transition prior, and
/// the resulting children are weighted by the observation likelihood and resampled.
pub struct BootstrapFilter {
    common: FilterCommon,
}

impl Debug for BootstrapFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapFilter")
            .field("num_particles", &self.common.num_particles())
            .field("last_processed", &self.common.last_processed())
            .finish()
    }
}

impl BootstrapFilter {
    pub fn new(
        first: &Arc<Observation>,
        network: Arc<dyn RoadNetwork>,
        params: &FilterParameters,
        seed: u64,
    ) -> Result<(Self, PosteriorDistribution), FilterError> {
        let mut common = FilterCommon::new(network, params, seed, first)?;
        let posterior = common.initial_posterior(first);
        Ok((BootstrapFilter { common }, posterior))
    }

    pub(crate) fn construct(
        first: &Arc<Observation>,
        network: Arc<dyn RoadNetwork>,
        params: &FilterParameters,
        seed: u64,
    ) -> Result<(Box<dyn RoadTrackingFilter>, PosteriorDistribution), FilterError> {
        let (filter, posterior) = BootstrapFilter::new(first, network, params, seed)?;
        Ok((Box::new(filter), posterior))
    }
}

impl RoadTrackingFilter for BootstrapFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Bootstrap
    }

    fn update(
        &mut self,
        prior: &PosteriorDistribution,
        observation: &Arc<Observation>,
    ) -> PosteriorDistribution {
        if prior.is_empty() {
            return self.common.initial_posterior(observation);
        }
        let dt = self.common.elapsed(observation);
        let num_particles = self.common.num_particles();
        let FilterCommon { model, rng, .. } = &mut self.common;

        // propagate: every copy of a particle samples one move from the transition prior
        let mut proposals: Vec<(Child, f64)> = Vec::new();
        for (state, count) in prior.iter() {
            let predicted = model.predict(state, dt);
            let hypotheses = model.hypotheses(Some(state), &predicted, observation, dt);
            let log_priors: Vec<f64> = hypotheses.iter().map(|h| h.log_prior).collect();
            let draws = multinomial_counts(&normalize_log_weights(&log_priors), count, rng);
            for (hypothesis, drawn) in hypotheses.into_iter().zip(draws) {
                if drawn == 0 {
                    continue;
                }
                let Hypothesis {
                    belief,
                    path,
                    log_likelihood,
                    ..
                } = hypothesis;
                let log_weight = (drawn as f64).ln() + log_likelihood;
                proposals.push((
                    Child {
                        parent: Some(state.id()),
                        belief,
                        path,
                        count: drawn,
                    },
                    log_weight,
                ));
            }
        }

        // resample the weighted children back to the particle count
        let log_weights: Vec<f64> = proposals.iter().map(|(_, w)| *w).collect();
        let counts = multinomial_counts(&normalize_log_weights(&log_weights), num_particles, rng);
        let children = proposals
            .into_iter()
            .zip(counts)
            .filter(|(_, count)| *count > 0)
            .map(|((child, _), count)| Child { count, ..child })
            .collect();
        self.common.commit(observation, children)
    }

    fn last_processed_time(&self) -> DateTime<Utc> {
        self.common.last_processed()
    }

    fn context(&self) -> FilterContext<'_> {
        self.common.context()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn normalize_handles_extremes() {
        let w = normalize_log_weights(&[-1000.0, -1000.0 + 2f64.ln()]);
        assert_approx_eq!(w[0], 1.0 / 3.0, 1e-12);
        assert_approx_eq!(w[1], 2.0 / 3.0, 1e-12);
        let uniform = normalize_log_weights(&[f64::NEG_INFINITY, f64::NEG_INFINITY]);
        assert_eq!(uniform, vec![0.5, 0.5]);
        assert!(normalize_log_weights(&[]).is_empty());
    }

    #[test]
    fn log_sum_exp_matches_direct_sum() {
        let values = [0.1f64, -2.0, 1.5];
        let direct = values.iter().map(|v| v.exp()).sum::<f64>().ln();
        assert_approx_eq!(log_sum_exp(&values), direct, 1e-12);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn multinomial_skips_zero_weights() {
        let mut rng = StdRng::seed_from_u64(42);
        let indices = multinomial_resample(&[0.0, 1.0, 0.0], 200, &mut rng);
        assert!(indices.iter().all(|&i| i == 1));
    }

    #[test]
    fn multinomial_counts_sum_to_n() {
        let mut rng = StdRng::seed_from_u64(7);
        let counts = multinomial_counts(&[0.2, 0.5, 0.3], 1000, &mut rng);
        assert_eq!(counts.iter().sum::<usize>(), 1000);
        assert!(counts[1] > counts[0] && counts[1] > counts[2]);
        let degenerate = multinomial_counts(&[0.0, 0.0], 10, &mut rng);
        assert_eq!(degenerate.iter().sum::<usize>(), 10);
    }

    #[test]
    fn multinomial_is_deterministic_for_a_seed() {
        let weights = [0.1, 0.4, 0.2, 0.3];
        let a = multinomial_resample(&weights, 50, &mut StdRng::seed_from_u64(9));
        let b = multinomial_resample(&weights, 50, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }
}
