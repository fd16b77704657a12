//! Per-vehicle inference instance.
//!
//! An instance owns one vehicle's filter, its current posterior, the off-road path map and
//! the result history. Every observation passes an admission gate first:
//!
//! 1. disabled or retired instances drop it;
//! 2. a fix that is not newer than the last processed one is stale and dropped;
//! 3. a fix at least `max_update_interval_s` after the last processed one discards the filter
//!    and posterior (the next fix starts over) and is itself dropped;
//! 4. anything else is processed, initializing a filter when there is none.
//!
//! Updates for one vehicle are serialized by the instance's core mutex. Readers of the result
//! history and the off-road map never wait for a running update: both are swapped or appended
//! under short-lived locks.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::config::{InferenceConfig, InfoLevel};
use crate::error::InferenceError;
use crate::filter::{EdgeVelocities, FilterContext, FilterKind, RoadTrackingFilter};
use crate::offroad::{OffRoadPathMap, OffRoadPathTracker};
use crate::recorder::{ResultRecord, ResultRecorder};
use crate::road::RoadNetwork;
use crate::state::{PosteriorDistribution, VehicleState};
use crate::{GeoPoint, Observation};

/// What happened to a submitted observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new filter was built from this observation.
    Initialized,
    /// The filter was updated with this observation.
    Processed,
    /// Recorded against ground truth without running the filter.
    Recorded,
    /// Not newer than the last processed observation; dropped.
    Stale,
    /// Too long after the last processed observation; the filter was discarded.
    Reset,
    /// The instance is disabled or retired; dropped.
    Disabled,
    /// No instance exists for the vehicle and none may be created; dropped.
    UnknownVehicle,
}

impl UpdateOutcome {
    /// Whether the observation produced a result record.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::Initialized | UpdateOutcome::Processed | UpdateOutcome::Recorded
        )
    }
}

/// Lifecycle of an instance's filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// No observation has been accepted yet.
    Uninitialized,
    /// A filter and posterior exist.
    Active,
    /// The filter was discarded after a long gap (or failed to build); the next accepted
    /// observation initializes a new one.
    Reset,
}

/// Running mean over the most recent samples.
#[derive(Clone, Debug)]
struct RunningAverage {
    window: usize,
    samples: VecDeque<f64>,
}

impl RunningAverage {
    fn new(window: usize) -> Self {
        RunningAverage {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }
    fn push(&mut self, value: f64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }
    fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }
}

/// Writer-side state, guarded by the instance mutex.
struct FilterCore {
    filter: Option<Box<dyn RoadTrackingFilter>>,
    posterior: Option<Arc<PosteriorDistribution>>,
    best_state: Option<VehicleState>,
    processing_ms: RunningAverage,
}

/// Inference state of a single vehicle.
pub struct InferenceInstance {
    vehicle_id: String,
    config: Arc<InferenceConfig>,
    network: Arc<dyn RoadNetwork>,
    seed: u64,
    core: Mutex<FilterCore>,
    records: RwLock<VecDeque<Arc<ResultRecord>>>,
    off_road_paths: RwLock<Arc<OffRoadPathMap>>,
    enabled: AtomicBool,
    registered: AtomicBool,
    // mirrors `core.filter.is_some()` so status queries never wait on a running update
    active: AtomicBool,
    records_processed: AtomicU64,
    total_records: AtomicU64,
    stale_dropped: AtomicU64,
}

impl std::fmt::Debug for InferenceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceInstance")
            .field("vehicle_id", &self.vehicle_id)
            .field("filter", &self.config.filter)
            .field("seed", &self.seed)
            .field("enabled", &self.is_enabled())
            .field("records_processed", &self.records_processed())
            .finish()
    }
}

impl InferenceInstance {
    pub fn new(vehicle_id: &str, config: Arc<InferenceConfig>, network: Arc<dyn RoadNetwork>) -> Self {
        let seed = config.seed;
        InferenceInstance::with_seed(vehicle_id, config, network, seed)
    }

    pub fn with_seed(
        vehicle_id: &str,
        config: Arc<InferenceConfig>,
        network: Arc<dyn RoadNetwork>,
        seed: u64,
    ) -> Self {
        let window = config.diagnostics_window;
        InferenceInstance {
            vehicle_id: vehicle_id.to_string(),
            config,
            network,
            seed,
            core: Mutex::new(FilterCore {
                filter: None,
                posterior: None,
                best_state: None,
                processing_ms: RunningAverage::new(window),
            }),
            records: RwLock::new(VecDeque::new()),
            off_road_paths: RwLock::new(Arc::new(OffRoadPathMap::new())),
            enabled: AtomicBool::new(true),
            registered: AtomicBool::new(true),
            active: AtomicBool::new(false),
            records_processed: AtomicU64::new(0),
            total_records: AtomicU64::new(0),
            stale_dropped: AtomicU64::new(0),
        }
    }

    /// Run one observation through the admission gate and, when accepted, the filter.
    pub fn update(&self, observation: Observation) -> Result<UpdateOutcome, InferenceError> {
        self.process(None, observation, true)
    }

    /// Simulation variant of [`InferenceInstance::update`]: the record also carries a
    /// snapshot of the true state, and the filter only runs when `perform_inference` is set.
    pub fn update_with_truth(
        &self,
        actual: &VehicleState,
        observation: Observation,
        perform_inference: bool,
    ) -> Result<UpdateOutcome, InferenceError> {
        self.process(Some(actual), observation, perform_inference)
    }

    fn process(
        &self,
        actual: Option<&VehicleState>,
        observation: Observation,
        perform_inference: bool,
    ) -> Result<UpdateOutcome, InferenceError> {
        self.total_records.fetch_add(1, Ordering::Relaxed);
        let mut core = self.lock_core()?;
        if let Some(dropped) = self.admit(&mut core, &observation) {
            return Ok(dropped);
        }
        let observation = Arc::new(observation);
        let prior = core.posterior.clone();
        let outcome = if perform_inference {
            self.run_filter(&mut core, &observation)?
        } else {
            UpdateOutcome::Recorded
        };
        let processed = self.records_processed.fetch_add(1, Ordering::Relaxed) + 1;

        let posterior = core.posterior.clone();
        if perform_inference && let Some(posterior) = posterior.as_deref() {
            let previous = self.off_road_paths();
            let tracked = OffRoadPathTracker::new(self.network.projection()).track(
                prior.as_deref(),
                posterior,
                &previous,
            );
            *self
                .off_road_paths
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Arc::new(tracked);
        }

        let paths = self.off_road_paths();
        let no_velocities = EdgeVelocities::default();
        let context = core
            .filter
            .as_ref()
            .map(|filter| filter.context())
            .unwrap_or_else(|| FilterContext::new(self.network.projection(), &no_velocities));
        let recorder = ResultRecorder::new(context, posterior.as_deref(), Some(&paths));
        let mut record = recorder.record(&observation, actual, core.best_state.as_ref());
        if self.config.info_level == InfoLevel::Debug {
            record.posterior = posterior;
        }
        self.push_record(record);

        if perform_inference && processed % self.config.diagnostics_window.max(1) as u64 == 0 {
            if let Some(ms) = core.processing_ms.mean() {
                info!(
                    "vehicle {}: {} records processed, avg {:.1} records/sec",
                    self.vehicle_id,
                    processed,
                    1000.0 / ms.max(1e-6)
                );
            }
        }
        Ok(outcome)
    }

    /// Returns the outcome for a dropped observation, `None` when it should be processed.
    fn admit(&self, core: &mut FilterCore, observation: &Observation) -> Option<UpdateOutcome> {
        if !self.is_registered() || !self.is_enabled() {
            debug!("vehicle {}: disabled, dropping fix at {}", self.vehicle_id, observation.timestamp);
            return Some(UpdateOutcome::Disabled);
        }
        let last = core.filter.as_ref()?.last_processed_time();
        let elapsed = observation.seconds_since(last);
        if elapsed <= 0.0 {
            self.stale_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "vehicle {}: stale fix at {} (last processed {})",
                self.vehicle_id, observation.timestamp, last
            );
            return Some(UpdateOutcome::Stale);
        }
        if elapsed >= self.config.max_update_interval_s {
            warn!(
                "vehicle {}: {:.0} s since last fix exceeds {:.0} s, resetting filter",
                self.vehicle_id, elapsed, self.config.max_update_interval_s
            );
            core.filter = None;
            core.posterior = None;
            self.active.store(false, Ordering::Release);
            return Some(UpdateOutcome::Reset);
        }
        None
    }

    fn run_filter(
        &self,
        core: &mut FilterCore,
        observation: &Arc<Observation>,
    ) -> Result<UpdateOutcome, InferenceError> {
        let started = Instant::now();
        let outcome = match (core.filter.as_mut(), core.posterior.as_ref()) {
            (Some(filter), Some(prior)) => {
                let posterior = filter.update(prior, observation);
                core.posterior = Some(Arc::new(posterior));
                UpdateOutcome::Processed
            }
            _ => {
                let (filter, posterior) = self
                    .config
                    .filter
                    .initialize(
                        observation,
                        Arc::clone(&self.network),
                        &self.config.parameters,
                        self.seed,
                    )
                    .map_err(|source| {
                        error!(
                            "vehicle {}: could not build {} filter: {}",
                            self.vehicle_id, self.config.filter, source
                        );
                        InferenceError::FilterConstruction {
                            vehicle_id: self.vehicle_id.clone(),
                            source,
                        }
                    })?;
                info!(
                    "vehicle {}: initialized {} filter with seed {}",
                    self.vehicle_id, self.config.filter, self.seed
                );
                core.filter = Some(filter);
                core.posterior = Some(Arc::new(posterior));
                self.active.store(true, Ordering::Release);
                UpdateOutcome::Initialized
            }
        };
        core.best_state = core
            .posterior
            .as_ref()
            .and_then(|p| p.max_weight_state().cloned());
        core.processing_ms
            .push(started.elapsed().as_secs_f64() * 1000.0);
        Ok(outcome)
    }

    fn push_record(&self, record: ResultRecord) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if self.config.info_level == InfoLevel::SingleResult {
            records.pop_front();
        }
        records.push_back(Arc::new(record));
    }

    fn lock_core(&self) -> Result<MutexGuard<'_, FilterCore>, InferenceError> {
        self.core
            .lock()
            .map_err(|_| InferenceError::Poisoned(self.vehicle_id.clone()))
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }
    pub fn seed(&self) -> u64 {
        self.seed
    }
    pub fn filter_kind(&self) -> FilterKind {
        self.config.filter
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
    /// Mark the instance as deregistered; every later observation is dropped.
    pub(crate) fn retire(&self) {
        self.registered.store(false, Ordering::Release);
    }

    /// Accepted observations, including the ones that initialized a filter.
    pub fn records_processed(&self) -> u64 {
        self.records_processed.load(Ordering::Relaxed)
    }
    /// Every submitted observation, accepted or not.
    pub fn total_records(&self) -> u64 {
        self.total_records.load(Ordering::Relaxed)
    }
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped.load(Ordering::Relaxed)
    }

    /// Lock-free: does not wait for an update in progress.
    pub fn state(&self) -> InstanceState {
        match (self.active.load(Ordering::Acquire), self.records_processed()) {
            (true, _) => InstanceState::Active,
            (false, 0) => InstanceState::Uninitialized,
            (false, _) => InstanceState::Reset,
        }
    }

    pub fn has_filter(&self) -> bool {
        self.state() == InstanceState::Active
    }

    pub fn last_processed_time(&self) -> Option<DateTime<Utc>> {
        let core = self.core.lock().ok()?;
        core.filter.as_ref().map(|f| f.last_processed_time())
    }

    pub fn posterior(&self) -> Option<Arc<PosteriorDistribution>> {
        self.core.lock().ok()?.posterior.clone()
    }

    /// Maximum-multiplicity particle of the latest posterior.
    pub fn best_state(&self) -> Option<VehicleState> {
        self.core.lock().ok()?.best_state.clone()
    }

    pub fn average_processing_ms(&self) -> Option<f64> {
        self.core.lock().ok()?.processing_ms.mean()
    }

    pub fn off_road_paths(&self) -> Arc<OffRoadPathMap> {
        Arc::clone(&self.off_road_paths.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn result_records(&self) -> Vec<Arc<ResultRecord>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn latest_record(&self) -> Option<Arc<ResultRecord>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    /// Inferred mean position of the latest result record.
    pub fn latest_position(&self) -> Option<GeoPoint> {
        self.latest_record()
            .and_then(|record| record.inferred_results.as_ref().map(|r| r.mean_coords))
    }
}
