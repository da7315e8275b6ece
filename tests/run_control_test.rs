//! Integration tests for the store-backed run-control authority.

use rand::Rng;
use runctl::control::{Notification, ProgramDefinition, RunControl};
use runctl::error::RcError;
use runctl::store::MemoryStore;
use runctl::transition::{INITIAL, NOT_READY, READY, READYING};
use std::sync::Arc;
use std::time::Duration;

fn fresh() -> RunControl {
    RunControl::new(Arc::new(MemoryStore::new())).unwrap()
}

fn def(host: &str) -> ProgramDefinition {
    ProgramDefinition::new("/usr/bin/readout", host)
}

fn drain(control: &RunControl) -> Vec<Notification> {
    let mut seen = Vec::new();
    control
        .process_messages(|_, notification| seen.push(notification.clone()))
        .unwrap();
    seen
}

#[test]
fn test_fresh_schema_defaults() {
    let control = fresh();
    assert_eq!(control.global_state().unwrap(), INITIAL);
    assert_eq!(control.title().unwrap(), "");
    assert_eq!(control.run_number().unwrap(), 0);
    assert!(!control.is_recording().unwrap());
    assert_eq!(control.timeout().unwrap(), Duration::from_secs(60));
    assert!(control.list_programs().unwrap().is_empty());
}

#[test]
fn test_attach_to_existing_schema_preserves_values() {
    let store = Arc::new(MemoryStore::new());
    let first = RunControl::new(store.clone()).unwrap();
    first.set_title("existing run").unwrap();
    first.add_program("readout", &def("daq01")).unwrap();

    let second = RunControl::new(store).unwrap();
    assert_eq!(second.title().unwrap(), "existing run");
    assert_eq!(second.list_programs().unwrap(), vec!["readout"]);
}

#[test]
fn test_program_registry_validation() {
    let control = fresh();
    control.add_program("readout", &def("daq01")).unwrap();
    assert!(matches!(
        control.add_program("readout", &def("daq02")),
        Err(RcError::DuplicateProgram(_))
    ));
    assert!(matches!(
        control.add_program("", &def("daq01")),
        Err(RcError::MissingField("name"))
    ));
    assert!(matches!(
        control.add_program("bare", &ProgramDefinition::new("", "daq01")),
        Err(RcError::MissingField("path"))
    ));
    assert!(matches!(
        control.modify_program("ghost", &def("daq01")),
        Err(RcError::UnknownProgram(_))
    ));
    assert!(matches!(
        control.delete_program("ghost"),
        Err(RcError::UnknownProgram(_))
    ));
}

#[test]
fn test_modify_program_keeps_state_variable() {
    let control = fresh();
    control.add_program("readout", &def("daq01")).unwrap();
    control.set_program_state("readout", NOT_READY).unwrap();

    let mut changed = def("daq02");
    changed.enabled = false;
    control.modify_program("readout", &changed).unwrap();

    let read_back = control.program_definition("readout").unwrap();
    assert_eq!(read_back.host, "daq02");
    assert!(!read_back.enabled);
    assert_eq!(control.program_state("readout").unwrap(), NOT_READY);
}

#[test]
fn test_derived_sets_partition_the_roster() {
    let control = fresh();
    let mut rng = rand::thread_rng();
    let mut expected_active = Vec::new();
    let mut expected_standalone = Vec::new();
    for i in 0..40 {
        let name = format!("prog{i:02}");
        let mut definition = def("daq01");
        definition.enabled = rng.gen();
        definition.standalone = rng.gen();
        control.add_program(&name, &definition).unwrap();
        if definition.enabled && !definition.standalone {
            expected_active.push(name.clone());
        }
        if definition.standalone {
            expected_standalone.push(name.clone());
        }
    }
    assert_eq!(control.list_active_programs().unwrap(), expected_active);
    assert_eq!(
        control.list_standalone_programs().unwrap(),
        expected_standalone
    );

    // Active and inactive partition the full roster.
    let mut together = control.list_active_programs().unwrap();
    together.extend(control.list_inactive_programs().unwrap());
    together.sort();
    assert_eq!(together, control.list_programs().unwrap());
}

#[test]
fn test_is_active_reflects_flags() {
    let control = fresh();
    control.add_program("alpha", &def("daq01")).unwrap();
    let mut lone = def("daq02");
    lone.standalone = true;
    control.add_program("lone", &lone).unwrap();
    let mut off = def("daq03");
    off.enabled = false;
    control.add_program("off", &off).unwrap();

    assert!(control.is_active("alpha").unwrap());
    assert!(!control.is_active("lone").unwrap());
    assert!(!control.is_active("off").unwrap());
    assert!(matches!(
        control.is_active("ghost"),
        Err(RcError::UnknownProgram(_))
    ));
}

#[test]
fn test_transition_legality_enforced() {
    let control = fresh();
    let err = control.set_global_state(READYING).unwrap_err();
    match err {
        RcError::TypeMismatch { .. } | RcError::IllegalTransition { .. } => {}
        other => panic!("unexpected error: {other}"),
    }
    control.set_global_state(NOT_READY).unwrap();
    control.set_global_state(READYING).unwrap();
    control.set_global_state(READY).unwrap();
    assert_eq!(control.global_state().unwrap(), READY);
}

#[test]
fn test_force_global_state_bypasses_the_table() {
    let control = fresh();
    control.force_global_state(READY).unwrap();
    assert_eq!(control.global_state().unwrap(), READY);
    // Forcing the current state again is a no-op, not an error.
    control.force_global_state(READY).unwrap();
    // The domain is still enforced.
    assert!(control.force_global_state("Exploded").is_err());
}

#[test]
fn test_mark_program_state_is_idempotent() {
    let control = fresh();
    control.add_program("readout", &def("daq01")).unwrap();
    control.mark_program_state("readout", NOT_READY).unwrap();
    control.mark_program_state("readout", NOT_READY).unwrap();
    assert_eq!(control.program_state("readout").unwrap(), NOT_READY);
}

#[test]
fn test_classification_of_state_changes() {
    let control = fresh();
    control.add_program("readout", &def("daq01")).unwrap();
    drain(&control);

    control.set_global_state(NOT_READY).unwrap();
    control.set_program_state("readout", NOT_READY).unwrap();
    control.set_title("titles are not state changes").unwrap();
    assert_eq!(
        drain(&control),
        vec![
            Notification::GlobalStateChange {
                state: NOT_READY.to_string()
            },
            Notification::ProgramStateChange {
                program: "readout".to_string(),
                state: NOT_READY.to_string()
            },
        ]
    );
}

#[test]
fn test_roster_diff_reports_joins_before_leaves() {
    let control = fresh();
    control.add_program("alpha", &def("daq01")).unwrap();
    assert_eq!(
        drain(&control),
        vec![Notification::ProgramJoins {
            program: "alpha".to_string()
        }]
    );

    // Both changes land before the next pass; joins still come first.
    control.delete_program("alpha").unwrap();
    control.add_program("beta", &def("daq02")).unwrap();
    assert_eq!(
        drain(&control),
        vec![
            Notification::ProgramJoins {
                program: "beta".to_string()
            },
            Notification::ProgramLeaves {
                program: "alpha".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_wait_transition_empty_active_set_converges_immediately() {
    let control = fresh();
    control.set_global_state(NOT_READY).unwrap();
    assert!(control.wait_transition().await.unwrap());
}

#[tokio::test]
async fn test_wait_transition_converges_when_participants_report() {
    let control = fresh();
    control.set_timeout(Duration::from_secs(5)).unwrap();
    control.add_program("alpha", &def("daq01")).unwrap();
    control.add_program("beta", &def("daq02")).unwrap();
    control.set_global_state(NOT_READY).unwrap();

    let writer = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.set_program_state("alpha", NOT_READY).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.set_program_state("beta", NOT_READY).unwrap();
    });

    let mut observed = Vec::new();
    let converged = control
        .wait_transition_with(|_, program, state| {
            observed.push((program.to_string(), state.to_string()));
        })
        .await
        .unwrap();
    assert!(converged);
    assert_eq!(
        observed,
        vec![
            ("alpha".to_string(), NOT_READY.to_string()),
            ("beta".to_string(), NOT_READY.to_string()),
        ]
    );
}

#[tokio::test]
async fn test_wait_transition_times_out_without_error() {
    let control = fresh();
    control.set_timeout(Duration::from_secs(0)).unwrap();
    control.add_program("alpha", &def("daq01")).unwrap();
    control.set_global_state(NOT_READY).unwrap();
    // Nobody reports; the wait ends with false, not an error.
    assert!(!control.wait_transition().await.unwrap());
    assert_eq!(control.global_state().unwrap(), NOT_READY);
}

#[tokio::test]
async fn test_wait_transition_ignores_standalone_participants() {
    let control = fresh();
    control.set_timeout(Duration::from_secs(5)).unwrap();
    control.add_program("alpha", &def("daq01")).unwrap();
    let mut lone = def("daq02");
    lone.standalone = true;
    control.add_program("lone", &lone).unwrap();
    control.set_global_state(NOT_READY).unwrap();

    let writer = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.set_program_state("alpha", NOT_READY).unwrap();
    });
    // Only alpha counts; lone never reports and convergence still succeeds.
    assert!(control.wait_transition().await.unwrap());
}
