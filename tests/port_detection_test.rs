//! Port probing and conflict classification.

use deckhand::logging::{MemorySink, SilentConsole};
use deckhand::{Detector, Logger, ServiceRecord, ServiceRole, ServiceState, StackConfig};
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;

fn quiet_detector(config: StackConfig) -> Detector {
    let logger = Arc::new(Logger::with_sinks(
        Box::new(MemorySink::new()),
        Box::new(SilentConsole),
        false,
    ));
    Detector::new(Arc::new(config), logger)
}

fn running_record(role: ServiceRole, name: &str, port: u16) -> ServiceRecord {
    ServiceRecord {
        name: name.to_string(),
        role,
        state: ServiceState::Running,
        container_id: (role != ServiceRole::ExternalService).then(|| format!("{}-cid", name)),
        image: None,
        port: Some(port),
        protocol: Some("tcp".to_string()),
        pid: (role == ServiceRole::ExternalService).then_some(4321),
        process_name: None,
        version: "unknown".to_string(),
        managed: role == ServiceRole::Managed,
        labels: BTreeMap::new(),
    }
}

#[test]
fn bound_port_is_reported_occupied() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    let port = listener.local_addr().unwrap().port();
    assert!(!Detector::is_port_free(port));
    drop(listener);
}

#[test]
fn find_free_port_returns_verified_free_or_sentinel() {
    let detector = quiet_detector(StackConfig::default());
    // Hold a port so the preferred choice is taken.
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    let held = listener.local_addr().unwrap().port();

    let suggestion = detector.find_free_port(held);
    assert_ne!(suggestion, held);
    if suggestion != 0 {
        // Verified free at the moment of return; nothing stronger is
        // promised (the probe is time-of-check-to-time-of-use racy).
        assert!(Detector::is_port_free(suggestion));
    }
}

#[test]
fn find_free_port_prefers_the_requested_port() {
    let detector = quiet_detector(StackConfig::default());
    // An ephemeral port that was just released is almost surely free.
    let probe = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    if Detector::is_port_free(port) {
        assert_eq!(detector.find_free_port(port), port);
    }
}

#[test]
fn exhausted_scan_range_yields_sentinel() {
    // A one-port scan range that is held by us leaves nothing to suggest.
    let listener = TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral port");
    let held = listener.local_addr().unwrap().port();
    let config = StackConfig {
        port_scan_range: (held, held),
        ..StackConfig::default()
    };
    let detector = quiet_detector(config);
    assert_eq!(detector.find_free_port(held), 0);
}

#[test]
fn managed_occupier_classified_auto_resolvable() {
    let detector = quiet_detector(StackConfig::default());
    let records = vec![running_record(ServiceRole::Managed, "deckhand-code", 8443)];
    let targets = BTreeMap::from([("workbench".to_string(), 8443u16)]);

    let conflicts = detector.classify_conflicts(&records, &targets);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].port, 8443);
    assert_eq!(conflicts[0].role, "workbench");
    assert!(conflicts[0].auto_resolvable);
    assert!(conflicts[0].hint.contains("upgrade in place"));
}

#[test]
fn same_kind_occupier_suggests_an_alternate_port() {
    let detector = quiet_detector(StackConfig::default());
    let records = vec![running_record(
        ServiceRole::ExternalSameKind,
        "foreign-ide",
        8443,
    )];
    let targets = BTreeMap::from([("workbench".to_string(), 8443u16)]);

    let conflicts = detector.classify_conflicts(&records, &targets);
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].auto_resolvable);
    assert!(conflicts[0].hint.contains("foreign-ide"));
    // The hint never proposes the conflicting port itself.
    assert!(!conflicts[0].hint.contains("port 8443"));
}

#[test]
fn unrelated_occupier_is_not_auto_resolvable() {
    let detector = quiet_detector(StackConfig::default());
    let records = vec![running_record(ServiceRole::ExternalService, "nginx", 8443)];
    let targets = BTreeMap::from([("workbench".to_string(), 8443u16)]);

    let conflicts = detector.classify_conflicts(&records, &targets);
    assert_eq!(conflicts.len(), 1);
    assert!(!conflicts[0].auto_resolvable);
    assert!(conflicts[0].occupied_by.is_some());
}

#[test]
fn squatter_outside_targets_reports_no_conflict() {
    let detector = quiet_detector(StackConfig::default());
    let records = vec![running_record(
        ServiceRole::ExternalService,
        "node_exporter",
        9100,
    )];
    // Target a genuinely free ephemeral-adjacent port.
    let probe = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    let free = probe.local_addr().unwrap().port();
    drop(probe);
    let targets = BTreeMap::from([("workbench".to_string(), free)]);

    let conflicts = detector.classify_conflicts(&records, &targets);
    assert!(conflicts.is_empty());
}
