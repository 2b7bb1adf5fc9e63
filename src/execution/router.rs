//! Routes upload events to the pipeline whose trigger rule matches

use crate::core::{ObjectCreatedEvent, TriggerRule};
use crate::topology::FleetTopology;
use tracing::debug;

pub struct EventRouter {
    rules: Vec<TriggerRule>,
}

impl EventRouter {
    pub fn new(rules: Vec<TriggerRule>) -> Self {
        Self { rules }
    }

    pub fn from_topology(topology: &FleetTopology) -> Self {
        Self::new(topology.trigger_rules())
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    /// The rule matching `event`. Rule prefixes never overlap, so there is
    /// at most one.
    pub fn route(&self, event: &ObjectCreatedEvent) -> Option<&TriggerRule> {
        let rule = self.rules.iter().find(|rule| rule.matches(event));
        if rule.is_none() {
            debug!("No pipeline for s3://{}/{}", event.bucket(), event.key());
        }
        rule
    }
}
