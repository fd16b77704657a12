//! Integration tests for the instance registry: vehicle lifecycle, batch intake and parallel
//! processing of many vehicles.
mod common;

use std::sync::Arc;

use common::{grid_network, main_street_drive};
use roadtrack::error::ObservationError;
use roadtrack::instance::InstanceState;
use roadtrack::{
    InferenceConfig, InferenceError, InstanceRegistry, RegistrationPolicy, UpdateOutcome,
};

fn registry(policy: RegistrationPolicy) -> InstanceRegistry {
    let config = InferenceConfig {
        registration: policy,
        info_level: roadtrack::InfoLevel::AllResults,
        ..InferenceConfig::default()
    };
    InstanceRegistry::new(Arc::new(config), grid_network())
}

const BATCH: &str = "20120430T133000,10.0,120.0,5,90,5
20120430T133010,10.0005,120.0005,5,90,5
";

#[test]
fn test_batch_is_processed_in_order() {
    let registry = registry(RegistrationPolicy::Lazy);
    let outcomes = registry.submit_batch("V1", BATCH).unwrap();
    assert_eq!(
        outcomes,
        vec![UpdateOutcome::Initialized, UpdateOutcome::Processed]
    );
    let history = registry.history("V1").unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].time < history[1].time);
}

#[test]
fn test_malformed_batch_changes_nothing() {
    let registry = registry(RegistrationPolicy::Lazy);
    registry.submit_batch("V1", BATCH).unwrap();
    let before = registry.status("V1").unwrap();

    let body = "20120430T133020,10.0006,120.0006,5,90,5\n20120430T133030,10.0007,120.0007,5,90\n";
    let err = registry.submit_batch("V1", body).unwrap_err();
    assert!(matches!(
        err,
        InferenceError::Observation(ObservationError::InvalidRecord { line: 2, .. })
    ));
    assert_eq!(registry.status("V1").unwrap(), before);

    // nothing is created for an unknown vehicle either
    assert!(registry.submit_batch("V2", "garbage").is_err());
    assert!(!registry.contains("V2"));
}

#[test]
fn test_explicit_registration_lifecycle() {
    let registry = registry(RegistrationPolicy::Explicit);
    assert_eq!(
        registry.submit_batch("V1", BATCH).unwrap(),
        vec![UpdateOutcome::UnknownVehicle; 2]
    );

    let instance = registry.register_with_seed("V1", 7);
    assert_eq!(instance.seed(), 7);
    assert_eq!(registry.status("V1").unwrap().state, InstanceState::Uninitialized);
    registry.submit_batch("V1", BATCH).unwrap();
    assert_eq!(registry.status("V1").unwrap().records_processed, 2);

    assert!(registry.disable("V1"));
    let outcomes = registry
        .submit_batch("V1", "20120430T133020,10.0006,120.0006,5,90,5")
        .unwrap();
    assert_eq!(outcomes, vec![UpdateOutcome::Disabled]);
    assert!(registry.enable("V1"));

    let removed = registry.deregister("V1").unwrap();
    assert!(Arc::ptr_eq(&removed, &instance));
    assert!(!registry.contains("V1"));
    assert!(registry.deregister("V1").is_none());
    // a held handle no longer accepts updates
    let late = roadtrack::Observation::parse_record("V1", "20120430T133030,10.0007,120.0007,5,90,5").unwrap();
    assert_eq!(instance.update(late).unwrap(), UpdateOutcome::Disabled);
    assert_eq!(instance.records_processed(), 2);
}

#[test]
fn test_deregistered_vehicle_is_not_recreated_lazily() {
    let registry = registry(RegistrationPolicy::Lazy);
    registry.submit_batch("V1", BATCH).unwrap();
    assert!(registry.deregister("V1").is_some());
    assert!(registry.is_deregistered("V1"));

    let late = "20120430T133020,10.0006,120.0006,5,90,5";
    assert_eq!(
        registry.submit_batch("V1", late).unwrap(),
        vec![UpdateOutcome::Disabled]
    );
    assert!(!registry.contains("V1"));
    assert!(registry.status("V1").is_none());
    let fix = roadtrack::Observation::parse_record("V1", late).unwrap();
    let results = registry.process_records(vec![fix]);
    assert_eq!(results["V1"].len(), 1);
    assert_eq!(*results["V1"][0].as_ref().unwrap(), UpdateOutcome::Disabled);
    assert!(registry.is_empty());

    // other vehicles are still created on demand
    assert_eq!(
        registry.submit_batch("V2", BATCH).unwrap()[0],
        UpdateOutcome::Initialized
    );

    // explicit registration brings the vehicle back with a fresh filter
    let instance = registry.register("V1");
    assert!(!registry.is_deregistered("V1"));
    assert_eq!(instance.records_processed(), 0);
    assert_eq!(
        registry.submit_batch("V1", late).unwrap(),
        vec![UpdateOutcome::Initialized]
    );
}

#[test]
fn test_vehicles_are_processed_in_parallel_and_in_order() {
    let registry = registry(RegistrationPolicy::Lazy);
    let ids: Vec<String> = (0..6).map(|i| format!("bus-{i}")).collect();
    // interleave the vehicles' fixes the way a live feed would
    let drives: Vec<_> = ids.iter().map(|id| main_street_drive(id, 5)).collect();
    let mut observations = Vec::new();
    for step in 0..5 {
        for drive in &drives {
            observations.push(drive[step].clone());
        }
    }

    let results = registry.process_records(observations);
    assert_eq!(results.len(), ids.len());
    for id in &ids {
        let outcomes: Vec<UpdateOutcome> = results[id]
            .iter()
            .map(|r| *r.as_ref().unwrap())
            .collect();
        assert_eq!(outcomes[0], UpdateOutcome::Initialized);
        assert!(outcomes[1..].iter().all(|o| *o == UpdateOutcome::Processed));

        let instance = registry.get(id).unwrap();
        assert_eq!(instance.records_processed(), 5);
        assert_eq!(
            instance.last_processed_time(),
            Some(drives[0][4].timestamp)
        );
        let history = instance.result_records();
        assert!(history.windows(2).all(|w| w[0].time < w[1].time));
    }
    assert_eq!(registry.vehicle_ids(), ids);
}

#[test]
fn test_status_reports_latest_position() {
    let registry = registry(RegistrationPolicy::Lazy);
    registry.submit_batch("V1", BATCH).unwrap();
    let status = registry.status("V1").unwrap();
    assert!(status.enabled);
    assert_eq!(status.state, InstanceState::Active);
    assert_eq!(status.total_records, 2);
    let position = status.latest_position.unwrap();
    assert!((position.latitude - 10.0005).abs() < 0.001);
    assert!((position.longitude - 120.0005).abs() < 0.001);
}
