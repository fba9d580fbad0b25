mod common;

use std::sync::Arc;

use serde_json::json;

use common::{add_building, check_in, descriptions, flavours, machine, machine_with};
use event_engine::{
    EngineConfig, EngineError, ErrorKind, EventMachine, InMemoryStore, Message, PassThroughFlavour,
    SnapshotPolicy, payload,
    store::{DocumentStore, MultiModelStore},
};

#[tokio::test]
async fn adding_a_building_records_one_event_and_a_snapshot() {
    for (flavour_name, flavour) in flavours() {
        let store = InMemoryStore::new();
        let machine = machine(flavour, Arc::new(store.clone()));

        let outcome = machine
            .dispatch_command(add_building("B1", "Acme"))
            .await
            .unwrap_or_else(|err| panic!("{flavour_name}: {err}"));
        assert_eq!(outcome.version, 1, "{flavour_name}");
        assert_eq!(outcome.events.len(), 1, "{flavour_name}");

        let history = store
            .read_aggregate("event_stream", "Building-B1", 0)
            .await
            .unwrap();
        assert_eq!(history.len(), 1, "{flavour_name}");
        assert_eq!(history[0].event.name(), "BuildingAdded", "{flavour_name}");
        assert_eq!(history[0].event.get("name"), Some(&json!("Acme")), "{flavour_name}");

        let snapshot = store
            .get_snapshot("building_state", "B1")
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{flavour_name}: no snapshot"));
        assert_eq!(snapshot.version, 1, "{flavour_name}");
        assert_eq!(
            snapshot.state,
            json!({"buildingId": "B1", "name": "Acme"}),
            "{flavour_name}"
        );
    }
}

#[tokio::test]
async fn adding_the_same_building_twice_fails() {
    for (flavour_name, flavour) in flavours() {
        let store = InMemoryStore::new();
        let machine = machine(flavour, Arc::new(store.clone()));

        machine
            .dispatch_command(add_building("B1", "Acme"))
            .await
            .unwrap_or_else(|err| panic!("{flavour_name}: {err}"));
        let err = machine
            .dispatch_command(add_building("B1", "Acme"))
            .await
            .unwrap_err();

        assert!(
            matches!(err, EngineError::AggregateAlreadyExists { ref aggregate_id, .. } if aggregate_id == "B1"),
            "{flavour_name}: {err}"
        );
        assert_eq!(
            store.aggregate_version("event_stream", "Building-B1").await.unwrap(),
            1,
            "{flavour_name}"
        );
    }
}

#[tokio::test]
async fn checking_in_twice_records_a_double_check_in() {
    for (flavour_name, flavour) in flavours() {
        let store = InMemoryStore::new();
        let machine = machine(flavour, Arc::new(store.clone()));

        machine.dispatch_command(add_building("B1", "Acme")).await.unwrap();
        machine.dispatch_command(check_in("B1", "John")).await.unwrap();

        let outcome = machine
            .dispatch_command(check_in("B1", "John"))
            .await
            .unwrap_or_else(|err| panic!("{flavour_name}: {err}"));
        let names: Vec<_> = outcome.events.iter().map(Message::name).collect();
        assert_eq!(names, ["DoubleCheckInDetected"], "{flavour_name}");

        let history: Vec<_> = machine
            .load_aggregate_events("Building", "B1")
            .await
            .unwrap()
            .iter()
            .map(|event| event.name().to_string())
            .collect();
        assert_eq!(
            history,
            ["BuildingAdded", "UserCheckedIn", "DoubleCheckInDetected"],
            "{flavour_name}"
        );

        let state = machine
            .load_aggregate_state("Building", "B1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.version, 3, "{flavour_name}");
        assert_eq!(state.state["users"], json!(["John"]), "{flavour_name}");
    }
}

#[tokio::test]
async fn commands_on_unknown_buildings_are_rejected() {
    for (flavour_name, flavour) in flavours() {
        let machine = machine(flavour, Arc::new(InMemoryStore::new()));
        let err = machine
            .dispatch_command(check_in("B404", "John"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, EngineError::AggregateNotFound { .. }),
            "{flavour_name}: {err}"
        );
    }
}

#[tokio::test]
async fn missing_identifiers_are_translation_errors() {
    for (flavour_name, flavour) in flavours() {
        let machine = machine(flavour, Arc::new(InMemoryStore::new()));
        let err = machine
            .dispatch_command(Message::command(
                "AddBuilding",
                payload(json!({"buildingId": "", "name": "Acme"})),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Translation, "{flavour_name}: {err}");
    }
}

#[tokio::test]
async fn unrouted_commands_are_configuration_errors() {
    for (flavour_name, flavour) in flavours() {
        let machine = machine(flavour, Arc::new(InMemoryStore::new()));
        let err = machine
            .dispatch_command(Message::command("DemolishBuilding", Default::default()))
            .await
            .unwrap_err();
        assert!(
            matches!(err, EngineError::UnroutedCommand { .. }),
            "{flavour_name}: {err}"
        );
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}

#[tokio::test]
async fn replay_and_snapshot_agree() {
    for (flavour_name, flavour) in flavours() {
        let store = InMemoryStore::new();
        let with_snapshots = machine(flavour.clone(), Arc::new(store.clone()));
        let replaying = machine_with(
            flavour,
            Arc::new(store.clone()),
            EngineConfig::default().with_snapshots(SnapshotPolicy::disabled()),
        );

        with_snapshots
            .dispatch_command(add_building("B1", "Acme"))
            .await
            .unwrap();
        for user in ["John", "Jane", "John"] {
            with_snapshots
                .dispatch_command(check_in("B1", user))
                .await
                .unwrap();
        }

        let from_snapshot = with_snapshots
            .load_aggregate_state("Building", "B1")
            .await
            .unwrap();
        let replayed = replaying.load_aggregate_state("Building", "B1").await.unwrap();
        let replayed_again = replaying.load_aggregate_state("Building", "B1").await.unwrap();

        assert_eq!(from_snapshot, replayed, "{flavour_name}");
        assert_eq!(replayed, replayed_again, "{flavour_name}");
        assert_eq!(replayed.unwrap().version, 4, "{flavour_name}");
    }
}

#[tokio::test]
async fn sparse_snapshots_replay_the_tail() {
    for (flavour_name, flavour) in flavours() {
        let store = InMemoryStore::new();
        let machine = machine_with(
            flavour,
            Arc::new(store.clone()),
            EngineConfig::default().with_snapshots(SnapshotPolicy {
                enabled: true,
                every: 2,
            }),
        );

        machine.dispatch_command(add_building("B1", "Acme")).await.unwrap();
        assert!(
            store.get_snapshot("building_state", "B1").await.unwrap().is_none(),
            "{flavour_name}"
        );
        machine.dispatch_command(check_in("B1", "John")).await.unwrap();
        machine.dispatch_command(check_in("B1", "Jane")).await.unwrap();

        let snapshot = store
            .get_snapshot("building_state", "B1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.version, 2, "{flavour_name}");

        let state = machine
            .load_aggregate_state("Building", "B1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.version, 3, "{flavour_name}");
        assert_eq!(state.state["users"], json!(["John", "Jane"]), "{flavour_name}");
    }
}

#[tokio::test]
async fn stream_version_counts_every_recorded_event() {
    for (flavour_name, flavour) in flavours() {
        let store = InMemoryStore::new();
        let machine = machine(flavour, Arc::new(store.clone()));

        let mut recorded = 0;
        for id in ["B1", "B2"] {
            recorded += machine
                .dispatch_command(add_building(id, "Acme"))
                .await
                .unwrap()
                .events
                .len();
        }
        for user in ["John", "Jane", "Jane"] {
            recorded += machine
                .dispatch_command(check_in("B1", user))
                .await
                .unwrap()
                .events
                .len();
        }

        let b1 = store.aggregate_version("event_stream", "Building-B1").await.unwrap();
        let b2 = store.aggregate_version("event_stream", "Building-B2").await.unwrap();
        assert_eq!(b1, 4, "{flavour_name}");
        assert_eq!(b2, 1, "{flavour_name}");
        assert_eq!(
            store.read_stream("event_stream", 1, 100).await.unwrap().len(),
            recorded,
            "{flavour_name}"
        );
        let snapshot = store.get_snapshot("building_state", "B1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, b1, "{flavour_name}");
    }
}

#[tokio::test]
async fn snapshots_are_queryable_documents() {
    let store = InMemoryStore::new();
    let machine = machine(Arc::new(common::functional()), Arc::new(store.clone()));
    machine.dispatch_command(add_building("B1", "Acme")).await.unwrap();
    machine.dispatch_command(add_building("B2", "Beta Tower")).await.unwrap();

    let towers: Vec<_> = store
        .find_docs(
            "building_state",
            &event_engine::DocFilter::contains("state.name", "Tower"),
        )
        .await
        .unwrap()
        .collect();
    assert_eq!(towers.len(), 1);
    assert_eq!(towers[0]["id"], json!("B2"));
}

#[tokio::test]
async fn unmapped_events_abort_the_command() {
    let flavour = common::pass_through().handler("Building::add", |d| {
        Ok(vec![Message::event("UserCheckedIn", d.command.payload().clone())])
    });
    let store = InMemoryStore::new();
    let machine = EventMachine::builder(descriptions(), Arc::new(flavour), Arc::new(store.clone()))
        .build()
        .unwrap();

    let err = machine
        .dispatch_command(add_building("B1", "Acme"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, EngineError::UnmappedEvent { ref event, .. } if event == "UserCheckedIn"),
        "{err}"
    );
    assert!(store.read_stream("event_stream", 1, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn typed_flavours_reject_malformed_payloads() {
    let machine = machine(Arc::new(common::functional()), Arc::new(InMemoryStore::new()));
    let err = machine
        .dispatch_command(Message::command(
            "AddBuilding",
            payload(json!({"buildingId": 7})),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MalformedPayload { .. }), "{err}");
}

#[tokio::test]
async fn compiled_descriptions_can_be_cached() {
    let cached = descriptions().to_cache().unwrap();
    let reloaded = event_engine::CompiledDescriptions::from_cache(&cached).unwrap();
    let store = InMemoryStore::new();
    let machine = EventMachine::builder(
        reloaded,
        Arc::new(PassThroughFlavour::new()),
        Arc::new(store),
    )
    .build();
    // functions are bound at build time, not cached
    assert!(machine.is_err());

    let machine = EventMachine::builder(
        event_engine::CompiledDescriptions::from_cache(&cached).unwrap(),
        Arc::new(common::pass_through()),
        Arc::new(InMemoryStore::new()),
    )
    .build()
    .unwrap();
    machine.dispatch_command(add_building("B1", "Acme")).await.unwrap();
}
