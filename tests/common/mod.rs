#![allow(dead_code)]

// Building domain shared by the integration tests, written once per flavour.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use event_engine::{
    CompiledDescriptions, Context, Decide, EngineConfig, EventMachine, EventSourced, Flavour,
    FunctionalFlavour, Message, ObjectFlavour, PassThroughFlavour, Recorder, Registry, Rejection,
    TypedMessage, description::DEFAULT_STREAM, payload, store::MultiModelStore,
};

pub fn descriptions() -> CompiledDescriptions {
    let mut registry = Registry::new();
    registry
        .register_command("AddBuilding", json!({"required": ["buildingId", "name"]}))
        .register_command("CheckInUser", json!({"required": ["buildingId", "name"]}))
        .register_event("BuildingAdded", json!({}))
        .register_event("UserCheckedIn", json!({}))
        .register_event("DoubleCheckInDetected", json!({}));

    registry
        .process("AddBuilding")
        .with_new("Building")
        .identified_by("buildingId")
        .handle("Building::add")
        .record_that("BuildingAdded")
        .apply("Building::whenBuildingAdded");
    registry
        .process("CheckInUser")
        .with_existing("Building")
        .handle("Building::checkIn")
        .record_that("UserCheckedIn")
        .apply("Building::whenUserCheckedIn")
        .or_record_that("DoubleCheckInDetected")
        .apply("Building::whenDoubleCheckInDetected");

    registry
        .watch(DEFAULT_STREAM)
        .with("building_details", "BuildingProjector")
        .filter_events(["BuildingAdded", "UserCheckedIn"]);

    registry.compile().expect("building descriptions compile")
}

pub fn add_building(id: &str, name: &str) -> Message {
    Message::command("AddBuilding", payload(json!({"buildingId": id, "name": name})))
}

pub fn check_in(id: &str, user: &str) -> Message {
    Message::command("CheckInUser", payload(json!({"buildingId": id, "name": user})))
}

pub fn machine(flavour: Arc<dyn Flavour>, store: Arc<dyn MultiModelStore>) -> EventMachine {
    machine_with(flavour, store, EngineConfig::default())
}

pub fn machine_with(
    flavour: Arc<dyn Flavour>,
    store: Arc<dyn MultiModelStore>,
    config: EngineConfig,
) -> EventMachine {
    EventMachine::builder(descriptions(), flavour, store)
        .config(config)
        .build()
        .expect("every building function is bound")
}

pub fn flavours() -> Vec<(&'static str, Arc<dyn Flavour>)> {
    vec![
        ("pass-through", Arc::new(pass_through())),
        ("functional", Arc::new(functional())),
        ("object", Arc::new(object())),
    ]
}

// Pass-through flavour: envelopes in, envelopes out, JSON state.

pub fn pass_through() -> PassThroughFlavour {
    PassThroughFlavour::new()
        .handler("Building::add", |d| {
            Ok(vec![Message::event("BuildingAdded", d.command.payload().clone())])
        })
        .handler("Building::checkIn", |d| {
            let user = d.command.get("name").cloned().unwrap_or(Value::Null);
            let present = d
                .state
                .and_then(|state| state.get("users"))
                .and_then(Value::as_array)
                .is_some_and(|users| users.contains(&user));
            let name = if present {
                "DoubleCheckInDetected"
            } else {
                "UserCheckedIn"
            };
            Ok(vec![Message::event(name, d.command.payload().clone())])
        })
        .apply("Building::whenBuildingAdded", |_, event| {
            json!({
                "buildingId": event.get("buildingId"),
                "name": event.get("name"),
            })
        })
        .apply("Building::whenUserCheckedIn", |state, event| {
            let mut state = state.unwrap_or_default();
            let user = event.get("name").cloned().unwrap_or(Value::Null);
            match state.get_mut("users").and_then(Value::as_array_mut) {
                Some(users) => users.push(user),
                None => state["users"] = json!([user]),
            }
            state
        })
        .apply("Building::whenDoubleCheckInDetected", |state, _| {
            state.unwrap_or_default()
        })
}

// Typed messages shared by the functional and object flavours.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddBuilding {
    #[serde(rename = "buildingId")]
    pub building_id: String,
    pub name: String,
}

impl TypedMessage for AddBuilding {
    fn message_name(&self) -> String {
        "AddBuilding".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInUser {
    #[serde(rename = "buildingId")]
    pub building_id: String,
    pub name: String,
}

impl TypedMessage for CheckInUser {
    fn message_name(&self) -> String {
        "CheckInUser".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BuildingEvent {
    BuildingAdded {
        #[serde(rename = "buildingId")]
        building_id: String,
        name: String,
    },
    UserCheckedIn {
        #[serde(rename = "buildingId")]
        building_id: String,
        name: String,
    },
    DoubleCheckInDetected {
        #[serde(rename = "buildingId")]
        building_id: String,
        name: String,
    },
}

impl TypedMessage for BuildingEvent {
    fn message_name(&self) -> String {
        match self {
            BuildingEvent::BuildingAdded { .. } => "BuildingAdded",
            BuildingEvent::UserCheckedIn { .. } => "UserCheckedIn",
            BuildingEvent::DoubleCheckInDetected { .. } => "DoubleCheckInDetected",
        }
        .to_string()
    }
}

const BUILDING_EVENTS: [&str; 3] = ["BuildingAdded", "UserCheckedIn", "DoubleCheckInDetected"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Building {
    #[serde(rename = "buildingId")]
    pub building_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
}

impl Building {
    fn evolve(mut self, event: &BuildingEvent) -> Self {
        match event {
            BuildingEvent::BuildingAdded { building_id, name } => {
                self.building_id = building_id.clone();
                self.name = name.clone();
            }
            BuildingEvent::UserCheckedIn { name, .. } => self.users.push(name.clone()),
            BuildingEvent::DoubleCheckInDetected { .. } => {}
        }
        self
    }

    fn check_in_event(&self, command: &CheckInUser) -> BuildingEvent {
        if self.users.contains(&command.name) {
            BuildingEvent::DoubleCheckInDetected {
                building_id: command.building_id.clone(),
                name: command.name.clone(),
            }
        } else {
            BuildingEvent::UserCheckedIn {
                building_id: command.building_id.clone(),
                name: command.name.clone(),
            }
        }
    }
}

// Functional flavour: pure decide and apply functions.

fn when(state: Option<Building>, event: &BuildingEvent) -> Building {
    state.unwrap_or_default().evolve(event)
}

pub fn functional() -> FunctionalFlavour {
    FunctionalFlavour::new()
        .command::<AddBuilding>("AddBuilding")
        .command::<CheckInUser>("CheckInUser")
        .tagged_events::<BuildingEvent, _, _>(BUILDING_EVENTS)
        .state::<Building>("Building")
        .handler("Building::add", |d: Decide<'_, Building, AddBuilding>| {
            Ok(vec![BuildingEvent::BuildingAdded {
                building_id: d.command.building_id.clone(),
                name: d.command.name.clone(),
            }])
        })
        .handler("Building::checkIn", |d: Decide<'_, Building, CheckInUser>| {
            let building = d
                .state
                .ok_or_else(|| Rejection::new("building has no state"))?;
            Ok(vec![building.check_in_event(d.command)])
        })
        .apply("Building::whenBuildingAdded", when)
        .apply("Building::whenUserCheckedIn", when)
        .apply("Building::whenDoubleCheckInDetected", when)
}

// Object flavour: the aggregate records its own events.

impl EventSourced for Building {
    type Event = BuildingEvent;

    fn apply(self, event: &BuildingEvent) -> Self {
        self.evolve(event)
    }
}

pub fn object() -> ObjectFlavour {
    ObjectFlavour::new()
        .aggregate::<Building>("Building")
        .command::<AddBuilding>("AddBuilding")
        .command::<CheckInUser>("CheckInUser")
        .tagged_events::<BuildingEvent, _, _>(BUILDING_EVENTS)
        .handler(
            "Building::add",
            |building: Recorder<Building>, command: &AddBuilding, _: Context<'_>| {
                Ok(building.record_that(BuildingEvent::BuildingAdded {
                    building_id: command.building_id.clone(),
                    name: command.name.clone(),
                }))
            },
        )
        .handler(
            "Building::checkIn",
            |building: Recorder<Building>, command: &CheckInUser, _: Context<'_>| {
                let event = building.state().check_in_event(command);
                Ok(building.record_that(event))
            },
        )
}
