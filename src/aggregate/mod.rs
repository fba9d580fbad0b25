use std::fmt::{Display, Formatter};

pub mod loader;
pub mod snapshot;

pub use loader::{AggregateLoader, LoadedAggregate};
pub use snapshot::AggregateSnapshot;

/// Handle of one aggregate instance: its type and domain identifier.
///
/// Aggregates are never shared as live objects; the runtime passes keys around and rebuilds state
/// from the store whenever it needs it. The string form `"{type}-{id}"` (e.g. `Building-B1`)
/// identifies the aggregate inside an event stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub aggregate_type: String,
    pub aggregate_id: String,
}

impl AggregateKey {
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }
}

impl Display for AggregateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.aggregate_type, self.aggregate_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(AggregateKey::new("Building", "B1").to_string(), "Building-B1");
    }
}
