//! Directory of per-vehicle inference instances.
//!
//! The registry is an explicit object handed to whoever submits observations; there is no
//! process-wide instance. Lookups only take the read lock, so vehicles never wait on each
//! other except while an instance is being created or removed.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{InferenceConfig, RegistrationPolicy};
use crate::error::InferenceError;
use crate::instance::{InferenceInstance, InstanceState, UpdateOutcome};
use crate::recorder::ResultRecord;
use crate::road::RoadNetwork;
use crate::{GeoPoint, Observation};

/// Summary of one vehicle for status queries.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VehicleStatus {
    pub vehicle_id: String,
    pub enabled: bool,
    #[serde(skip)]
    pub state: InstanceState,
    pub records_processed: u64,
    pub total_records: u64,
    pub latest_position: Option<GeoPoint>,
}

/// Per-vehicle results of [`InstanceRegistry::process_records`], keyed by vehicle id.
pub type BatchResults = BTreeMap<String, Vec<Result<UpdateOutcome, InferenceError>>>;

pub struct InstanceRegistry {
    config: Arc<InferenceConfig>,
    network: Arc<dyn RoadNetwork>,
    instances: RwLock<HashMap<String, Arc<InferenceInstance>>>,
    // deregistered ids; lazy registration never brings these back
    deregistered: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("filter", &self.config.filter)
            .field("registration", &self.config.registration)
            .field("vehicles", &self.len())
            .finish()
    }
}

impl InstanceRegistry {
    pub fn new(config: Arc<InferenceConfig>, network: Arc<dyn RoadNetwork>) -> Self {
        InstanceRegistry {
            config,
            network,
            instances: RwLock::new(HashMap::new()),
            deregistered: RwLock::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<dyn RoadNetwork> {
        &self.network
    }

    /// Register a vehicle seeded from the configuration. Registering an existing vehicle
    /// returns the existing instance.
    pub fn register(&self, vehicle_id: &str) -> Arc<InferenceInstance> {
        self.register_with_seed(vehicle_id, self.config.seed)
    }

    /// Register a vehicle with its own filter seed. This also lifts an earlier
    /// deregistration of the same id.
    pub fn register_with_seed(&self, vehicle_id: &str, seed: u64) -> Arc<InferenceInstance> {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        self.deregistered
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(vehicle_id);
        let instance = instances.entry(vehicle_id.to_string()).or_insert_with(|| {
            info!(
                "registered vehicle {} ({} filter, seed {})",
                vehicle_id, self.config.filter, seed
            );
            Arc::new(InferenceInstance::with_seed(
                vehicle_id,
                Arc::clone(&self.config),
                Arc::clone(&self.network),
                seed,
            ))
        });
        Arc::clone(instance)
    }

    /// Remove a vehicle. The removed instance is retired, so anyone still holding it sees
    /// every later update dropped, and later fixes for the id are dropped as `Disabled`
    /// until it is registered again.
    pub fn deregister(&self, vehicle_id: &str) -> Option<Arc<InferenceInstance>> {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        let removed = instances.remove(vehicle_id);
        if let Some(instance) = &removed {
            self.deregistered
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(vehicle_id.to_string());
            instance.retire();
            info!("deregistered vehicle {}", vehicle_id);
        }
        removed
    }

    /// Returns `false` when the vehicle is unknown.
    pub fn enable(&self, vehicle_id: &str) -> bool {
        match self.get(vehicle_id) {
            Some(instance) => {
                instance.enable();
                true
            }
            None => false,
        }
    }

    /// Returns `false` when the vehicle is unknown.
    pub fn disable(&self, vehicle_id: &str) -> bool {
        match self.get(vehicle_id) {
            Some(instance) => {
                instance.disable();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, vehicle_id: &str) -> Option<Arc<InferenceInstance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vehicle_id)
            .cloned()
    }

    /// Whether the vehicle was deregistered and not registered again since.
    pub fn is_deregistered(&self, vehicle_id: &str) -> bool {
        self.deregistered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(vehicle_id)
    }

    pub fn contains(&self, vehicle_id: &str) -> bool {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(vehicle_id)
    }

    pub fn vehicle_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self, vehicle_id: &str) -> Option<VehicleStatus> {
        let instance = self.get(vehicle_id)?;
        Some(VehicleStatus {
            vehicle_id: instance.vehicle_id().to_string(),
            enabled: instance.is_enabled(),
            state: instance.state(),
            records_processed: instance.records_processed(),
            total_records: instance.total_records(),
            latest_position: instance.latest_position(),
        })
    }

    pub fn history(&self, vehicle_id: &str) -> Option<Vec<Arc<ResultRecord>>> {
        self.get(vehicle_id).map(|instance| instance.result_records())
    }

    /// Route one observation to its vehicle's instance, creating the instance when the
    /// registration policy allows it.
    pub fn submit_observation(&self, observation: Observation) -> Result<UpdateOutcome, InferenceError> {
        let instance = match self.get(&observation.vehicle_id) {
            Some(instance) => instance,
            None => match self.config.registration {
                RegistrationPolicy::Lazy => match self.lazy_register(&observation.vehicle_id) {
                    Some(instance) => instance,
                    None => {
                        debug!(
                            "dropping fix for deregistered vehicle {}",
                            observation.vehicle_id
                        );
                        return Ok(UpdateOutcome::Disabled);
                    }
                },
                RegistrationPolicy::Explicit => {
                    debug!(
                        "dropping fix for unregistered vehicle {}",
                        observation.vehicle_id
                    );
                    return Ok(UpdateOutcome::UnknownVehicle);
                }
            },
        };
        instance.update(observation)
    }

    /// Create an instance for an unseen vehicle, unless the id was deregistered. The check
    /// and the insert happen under the same write lock as `deregister`.
    fn lazy_register(&self, vehicle_id: &str) -> Option<Arc<InferenceInstance>> {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_deregistered(vehicle_id) {
            return None;
        }
        let instance = instances.entry(vehicle_id.to_string()).or_insert_with(|| {
            info!(
                "registered vehicle {} ({} filter, seed {})",
                vehicle_id, self.config.filter, self.config.seed
            );
            Arc::new(InferenceInstance::new(
                vehicle_id,
                Arc::clone(&self.config),
                Arc::clone(&self.network),
            ))
        });
        Some(Arc::clone(instance))
    }

    /// Parse a newline separated batch of records for one vehicle and process them in order.
    ///
    /// The whole batch is parsed before anything is processed, so a malformed line leaves
    /// every instance untouched.
    pub fn submit_batch(&self, vehicle_id: &str, body: &str) -> Result<Vec<UpdateOutcome>, InferenceError> {
        let observations = Observation::parse_batch(vehicle_id, body)?;
        observations
            .into_iter()
            .map(|observation| self.submit_observation(observation))
            .collect()
    }

    /// Process observations from many vehicles. Vehicles are processed in parallel; the fixes
    /// of one vehicle are processed in the order given.
    pub fn process_records(&self, observations: Vec<Observation>) -> BatchResults {
        let mut grouped: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
        for observation in observations {
            grouped
                .entry(observation.vehicle_id.clone())
                .or_default()
                .push(observation);
        }
        grouped
            .into_par_iter()
            .map(|(vehicle_id, fixes)| {
                let outcomes = fixes
                    .into_iter()
                    .map(|observation| self.submit_observation(observation))
                    .collect();
                (vehicle_id, outcomes)
            })
            .collect()
    }
}
