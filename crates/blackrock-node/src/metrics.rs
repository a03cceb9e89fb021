//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use blackrock_common::MachineRole;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::Result;

/// Outcome label for a role request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The slot was empty and this call filled it.
    Created,
    /// The slot was already populated.
    Reused,
    /// Construction failed; the slot is still empty.
    Failed,
}

impl RequestOutcome {
    fn as_label(self) -> &'static str {
        match self {
            RequestOutcome::Created => "created",
            RequestOutcome::Reused => "reused",
            RequestOutcome::Failed => "failed",
        }
    }
}

fn role_label(role: MachineRole) -> &'static str {
    match role {
        MachineRole::Storage => "storage",
        MachineRole::Worker => "worker",
    }
}

/// Metrics published by the role agent.
#[derive(Clone)]
pub struct NodeMetrics {
    roles_constructed: IntCounterVec,
    role_requests: IntCounterVec,
    roles_populated: IntGauge,
    registry: Registry,
}

impl NodeMetrics {
    /// Register all node metrics with the provided registry.
    pub fn new(registry: &Registry) -> Result<Self> {
        let roles_constructed = IntCounterVec::new(
            Opts::new(
                "blackrock_role_contexts_constructed_total",
                "Role contexts built by this agent; at most one per role per process",
            ),
            &["role"],
        )?;
        registry.register(Box::new(roles_constructed.clone()))?;

        let role_requests = IntCounterVec::new(
            Opts::new(
                "blackrock_role_requests_total",
                "Role assignment requests by role and outcome",
            ),
            &["role", "outcome"],
        )?;
        registry.register(Box::new(role_requests.clone()))?;

        let roles_populated = IntGauge::new(
            "blackrock_roles_populated",
            "Number of role slots currently populated",
        )?;
        registry.register(Box::new(roles_populated.clone()))?;

        Ok(Self {
            roles_constructed,
            role_requests,
            roles_populated,
            registry: registry.clone(),
        })
    }

    /// Encode everything in the backing registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&families)?)
    }

    /// Record that a role context was built.
    pub fn record_constructed(&self, role: MachineRole) {
        self.roles_constructed
            .with_label_values(&[role_label(role)])
            .inc();
        self.roles_populated.inc();
    }

    /// Record a role request and its outcome.
    pub fn record_request(&self, role: MachineRole, outcome: RequestOutcome) {
        self.role_requests
            .with_label_values(&[role_label(role), outcome.as_label()])
            .inc();
    }

    /// Number of contexts built for `role` so far.
    pub fn constructed(&self, role: MachineRole) -> u64 {
        self.roles_constructed
            .with_label_values(&[role_label(role)])
            .get()
    }

    /// Number of requests for `role` that ended with `outcome`.
    pub fn requests(&self, role: MachineRole, outcome: RequestOutcome) -> u64 {
        self.role_requests
            .with_label_values(&[role_label(role), outcome.as_label()])
            .get()
    }
}

impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exported() {
        let registry = Registry::new();
        let metrics = NodeMetrics::new(&registry).unwrap();
        metrics.record_constructed(MachineRole::Storage);
        metrics.record_request(MachineRole::Storage, RequestOutcome::Created);
        metrics.record_request(MachineRole::Storage, RequestOutcome::Reused);

        assert_eq!(metrics.constructed(MachineRole::Storage), 1);
        assert_eq!(metrics.constructed(MachineRole::Worker), 0);
        assert_eq!(metrics.requests(MachineRole::Storage, RequestOutcome::Reused), 1);

        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"blackrock_role_requests_total".to_owned()));
        assert!(names.contains(&"blackrock_roles_populated".to_owned()));
    }

    #[test]
    fn render_includes_labelled_counters() {
        let registry = Registry::new();
        let metrics = NodeMetrics::new(&registry).unwrap();
        metrics.record_constructed(MachineRole::Worker);
        metrics.record_request(MachineRole::Worker, RequestOutcome::Created);

        let text = metrics.render().unwrap();
        assert!(text.contains("# TYPE blackrock_role_requests_total counter"));
        assert!(text.contains("blackrock_role_contexts_constructed_total{role=\"worker\"} 1"));
        assert!(text.contains("blackrock_roles_populated 1"));
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        NodeMetrics::new(&registry).unwrap();
        assert!(NodeMetrics::new(&registry).is_err());
    }
}
