//! Particle-learning road tracking filter.
//!
//! Resample-then-propagate: a parent is weighted by the predictive likelihood of the new fix
//! summed over all of its hypotheses, parents are resampled on those weights, and only then
//! does every surviving copy draw its move from the hypothesis posterior. Compared with the
//! bootstrap filter, fewer particles are wasted on moves the fix immediately rules out.
use std::fmt::{self, Debug};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::Observation;
use crate::config::FilterParameters;
use crate::error::FilterError;
use crate::filter::{
    Child, FilterCommon, FilterContext, FilterKind, Hypothesis, RoadTrackingFilter,
};
use crate::particle::{log_sum_exp, multinomial_counts, normalize_log_weights};
use crate::road::RoadNetwork;
use crate::state::PosteriorDistribution;

pub struct ParticleLearningFilter {
    common: FilterCommon,
}

impl Debug for ParticleLearningFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleLearningFilter")
            .field("num_particles", &self.common.num_particles())
            .field("last_processed", &self.common.last_processed())
            .finish()
    }
}

impl ParticleLearningFilter {
    pub fn new(
        first: &Arc<Observation>,
        network: Arc<dyn RoadNetwork>,
        params: &FilterParameters,
        seed: u64,
    ) -> Result<(Self, PosteriorDistribution), FilterError> {
        let mut common = FilterCommon::new(network, params, seed, first)?;
        let posterior = common.initial_posterior(first);
        Ok((ParticleLearningFilter { common }, posterior))
    }

    pub(crate) fn construct(
        first: &Arc<Observation>,
        network: Arc<dyn RoadNetwork>,
        params: &FilterParameters,
        seed: u64,
    ) -> Result<(Box<dyn RoadTrackingFilter>, PosteriorDistribution), FilterError> {
        let (filter, posterior) = ParticleLearningFilter::new(first, network, params, seed)?;
        Ok((Box::new(filter), posterior))
    }
}

impl RoadTrackingFilter for ParticleLearningFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::ParticleLearning
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

        let mut parents = Vec::with_capacity(prior.len());
        let mut log_weights = Vec::with_capacity(prior.len());
        for (state, count) in prior.iter() {
            let predicted = model.predict(state, dt);
            let hypotheses = model.hypotheses(Some(state), &predicted, observation, dt);
            let log_joint: Vec<f64> = hypotheses.iter().map(Hypothesis::log_joint).collect();
            log_weights.push((count as f64).ln() + log_sum_exp(&log_joint));
            parents.push((state.id(), hypotheses, log_joint));
        }

        let survivors = multinomial_counts(&normalize_log_weights(&log_weights), num_particles, rng);
        let mut children = Vec::new();
        for ((parent, hypotheses, log_joint), copies) in parents.into_iter().zip(survivors) {
            if copies == 0 {
                continue;
            }
            let draws = multinomial_counts(&normalize_log_weights(&log_joint), copies, rng);
            for (hypothesis, count) in hypotheses.into_iter().zip(draws) {
                if count > 0 {
                    children.push(Child {
                        parent: Some(parent),
                        belief: hypothesis.belief,
                        path: hypothesis.path,
                        count,
                    });
                }
            }
        }
        self.common.commit(observation, children)
    }

    fn last_processed_time(&self) -> DateTime<Utc> {
        self.common.last_processed()
    }

    fn context(&self) -> FilterContext<'_> {
        self.common.context()
    }
}
