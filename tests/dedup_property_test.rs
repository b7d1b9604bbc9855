//! Property tests for detection deduplication.

use deckhand::detect::{dedup, ServiceRecord, ServiceRole, ServiceState};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn arb_role() -> impl Strategy<Value = ServiceRole> {
    prop_oneof![
        Just(ServiceRole::Managed),
        Just(ServiceRole::ExternalService),
        Just(ServiceRole::ExternalSameKind),
        Just(ServiceRole::VpnDaemon),
    ]
}

prop_compose! {
    fn arb_record()(
        role in arb_role(),
        has_cid in any::<bool>(),
        cid in "[a-f0-9]{12}",
        port in proptest::option::of(1024u16..9999),
        pid in proptest::option::of(2u32..65535),
        name in "[a-z]{3,10}",
    ) -> ServiceRecord {
        ServiceRecord {
            name,
            role,
            state: ServiceState::Running,
            container_id: has_cid.then_some(cid),
            image: None,
            port,
            protocol: port.map(|_| "tcp".to_string()),
            pid,
            process_name: None,
            version: "unknown".to_string(),
            managed: role == ServiceRole::Managed,
            labels: BTreeMap::new(),
        }
    }
}

proptest! {
    /// Deduplicating an already-deduplicated set changes nothing.
    #[test]
    fn dedup_is_idempotent(records in proptest::collection::vec(arb_record(), 0..24)) {
        let once = dedup(records);
        let names: Vec<String> = once.iter().map(|r| r.name.clone()).collect();
        let twice = dedup(once);
        let names_after: Vec<String> = twice.iter().map(|r| r.name.clone()).collect();
        prop_assert_eq!(names, names_after);
    }

    /// Dedup never grows the set and keeps first-seen order.
    #[test]
    fn dedup_is_a_subsequence(records in proptest::collection::vec(arb_record(), 0..24)) {
        let deduped = dedup(records.clone());
        prop_assert!(deduped.len() <= records.len());

        // Every kept record appears in the input, in order.
        let mut input = records.iter();
        for kept in &deduped {
            let found = input.any(|r| {
                r.name == kept.name
                    && r.role == kept.role
                    && r.container_id == kept.container_id
                    && r.port == kept.port
                    && r.pid == kept.pid
            });
            prop_assert!(found);
        }
    }
}
