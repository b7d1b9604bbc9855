//! Strategy selection scenarios.
//!
//! Strategy choice is a pure function of the categorized detection
//! snapshot, so these tests feed hand-built records through the planner and
//! assert on the resulting plan without touching Docker.

use deckhand::{
    ActionType, Logger, MigrationStrategy, Migrator, ServiceRecord, ServiceRole, ServiceState,
    StackConfig,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn quiet_migrator() -> Migrator {
    let logger = Arc::new(Logger::with_sinks(
        Box::new(deckhand::logging::MemorySink::new()),
        Box::new(deckhand::logging::SilentConsole),
        false,
    ));
    Migrator::new(Arc::new(StackConfig::default()), logger)
}

fn record(role: ServiceRole, name: &str, port: Option<u16>, state: ServiceState) -> ServiceRecord {
    ServiceRecord {
        name: name.to_string(),
        role,
        state,
        container_id: (role != ServiceRole::ExternalService).then(|| format!("{}-cid", name)),
        image: None,
        port,
        protocol: port.map(|_| "tcp".to_string()),
        pid: (role == ServiceRole::ExternalService).then_some(31337),
        process_name: (role == ServiceRole::ExternalService).then(|| name.to_string()),
        version: "unknown".to_string(),
        managed: role == ServiceRole::Managed,
        labels: BTreeMap::new(),
    }
}

fn app_on_8443() -> BTreeMap<String, u16> {
    BTreeMap::from([("workbench".to_string(), 8443u16)])
}

#[test]
fn healthy_managed_container_on_8443_upgrades_in_order() {
    let migrator = quiet_migrator();
    let records = vec![record(
        ServiceRole::Managed,
        "deckhand-code",
        Some(8443),
        ServiceState::Healthy,
    )];

    let plan = migrator.plan_for(records, &app_on_8443());

    assert_eq!(plan.strategy, MigrationStrategy::Upgrade);
    let kinds: Vec<ActionType> = plan.actions.iter().map(|a| a.action).collect();
    assert_eq!(
        kinds,
        vec![
            ActionType::Backup,
            ActionType::Stop,
            ActionType::Pull,
            ActionType::Start,
        ]
    );
    // Order indices ascend from 1 with no gaps.
    for (i, action) in plan.actions.iter().enumerate() {
        assert_eq!(action.order, i + 1);
    }
    assert!(!plan.requires_confirmation);
}

#[test]
fn external_web_ide_on_8443_triggers_confirmed_migration() {
    let migrator = quiet_migrator();
    let records = vec![record(
        ServiceRole::ExternalSameKind,
        "someone-elses-ide",
        Some(8443),
        ServiceState::Running,
    )];

    let plan = migrator.plan_for(records, &app_on_8443());

    assert_eq!(plan.strategy, MigrationStrategy::MigrateExternal);
    assert!(plan.requires_confirmation);
    assert!(!plan.warnings.is_empty());
    assert!(plan.warnings[0].contains("preserved"));
}

#[test]
fn unrecognized_process_outside_targets_is_ignored() {
    let migrator = quiet_migrator();
    let records = vec![record(
        ServiceRole::ExternalService,
        "node_exporter",
        Some(9100),
        ServiceState::Running,
    )];

    let plan = migrator.plan_for(records, &app_on_8443());

    assert_eq!(plan.strategy, MigrationStrategy::Fresh);
    assert!(plan.warnings.is_empty());
}

#[test]
fn unrecognized_process_on_target_port_runs_parallel() {
    let migrator = quiet_migrator();
    let records = vec![record(
        ServiceRole::ExternalService,
        "nginx",
        Some(8443),
        ServiceState::Running,
    )];

    let plan = migrator.plan_for(records, &app_on_8443());

    assert_eq!(plan.strategy, MigrationStrategy::Parallel);
    assert_ne!(plan.ports["workbench"], 8443);
}

#[test]
fn empty_machine_gets_fresh_install() {
    let migrator = quiet_migrator();
    let plan = migrator.plan_for(vec![], &app_on_8443());
    assert_eq!(plan.strategy, MigrationStrategy::Fresh);
}

#[test]
fn priority_managed_over_external_over_squatter() {
    let migrator = quiet_migrator();
    let everything = vec![
        record(
            ServiceRole::ExternalService,
            "nginx",
            Some(8443),
            ServiceState::Running,
        ),
        record(
            ServiceRole::ExternalSameKind,
            "foreign-ide",
            Some(8080),
            ServiceState::Running,
        ),
        record(
            ServiceRole::Managed,
            "deckhand-code",
            None,
            ServiceState::Stopped,
        ),
    ];

    let plan = migrator.plan_for(everything.clone(), &app_on_8443());
    assert_eq!(plan.strategy, MigrationStrategy::Upgrade);

    // Without the managed record, the same snapshot migrates.
    let without_managed: Vec<ServiceRecord> = everything
        .iter()
        .filter(|r| r.role != ServiceRole::Managed)
        .cloned()
        .collect();
    let plan = migrator.plan_for(without_managed, &app_on_8443());
    assert_eq!(plan.strategy, MigrationStrategy::MigrateExternal);
}

#[test]
fn plan_summary_lists_everything_a_caller_renders() {
    let migrator = quiet_migrator();
    let records = vec![record(
        ServiceRole::ExternalSameKind,
        "foreign-ide",
        Some(8443),
        ServiceState::Running,
    )];
    let plan = migrator.plan_for(records, &app_on_8443());
    let summary = plan.summary();

    assert!(summary.contains("migrate-external"));
    assert!(summary.contains("foreign-ide"));
    assert!(summary.contains("[reversible] stop"));
    assert!(summary.contains("[one-way] migrate-data"));
    assert!(summary.contains("requires confirmation"));
}
