//! Flow definitions and gating policy: immutable configuration loaded once
//! at startup, either from JSON or through the builder.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One scheduled message within a flow: wait `delay_ms`, then send
/// `template` with the named placeholders in `params` resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub delay_ms: u64,
    pub template: String,
    /// Placeholder references, e.g. `["{customer_name}", "{checkout_url}"]`.
    pub params: Vec<String>,
}

impl StepDefinition {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Ordered steps for one client's checkout-reminder sequence. Steps execute
/// strictly in order; later steps assume earlier ones already ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Substituted for `{checkout_url}` in step parameters.
    pub checkout_url: String,
    pub steps: Vec<StepDefinition>,
}

/// Stable identifier of the step at `index` (zero-based) in a definition.
pub fn step_id(index: usize) -> String {
    format!("step_{}", index + 1)
}

/// Resolve a step's placeholder references against the trigger's variables.
///
/// `{customer_name}` falls back to the literal "there" when the trigger has
/// no display name; placeholders with no known variable resolve to the empty
/// string. Resolution never fails: a missing variable must not abort a send.
pub fn resolve_params(params: &[String], customer_name: Option<&str>, checkout_url: &str) -> Vec<String> {
    params
        .iter()
        .map(|p| {
            let key = p.trim_matches(|c| c == '{' || c == '}');
            match key {
                "customer_name" => customer_name.unwrap_or("there").to_string(),
                "checkout_url" => checkout_url.to_string(),
                _ => String::new(),
            }
        })
        .collect()
}

/// Immutable mapping from client id to its flow definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowCatalog {
    flows: HashMap<String, FlowDefinition>,
}

impl FlowCatalog {
    pub fn builder() -> FlowCatalogBuilder {
        FlowCatalogBuilder { flows: HashMap::new() }
    }

    pub fn get(&self, client_id: &str) -> Option<&FlowDefinition> {
        self.flows.get(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.flows.contains_key(client_id)
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        let flows: HashMap<String, FlowDefinition> = serde_json::from_str(json)?;
        Ok(Self { flows })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(std::io::Error::other)
    }
}

/// Builder for programmatic catalog construction (tests, demos).
pub struct FlowCatalogBuilder {
    flows: HashMap<String, FlowDefinition>,
}

impl FlowCatalogBuilder {
    pub fn register(mut self, client_id: impl Into<String>, definition: FlowDefinition) -> Self {
        self.flows.insert(client_id.into(), definition);
        self
    }

    pub fn build(self) -> FlowCatalog {
        FlowCatalog { flows: self.flows }
    }
}

/// Anti-spam policy knobs. All windows and ceilings are configuration, not
/// embedded constants; defaults match the production policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatePolicy {
    /// Max sends to one recipient within `send_window_ms` (sliding).
    pub max_sends_per_recipient: u32,
    pub send_window_ms: u64,
    /// Max flow starts for one recipient within `flow_window_ms`.
    pub max_flows_per_recipient: u32,
    pub flow_window_ms: i64,
    /// A customer with a record created within this span is a duplicate.
    pub min_ms_between_flows: i64,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            max_sends_per_recipient: 10,
            send_window_ms: 60 * 60 * 1000,
            max_flows_per_recipient: 3,
            flow_window_ms: 24 * 60 * 60 * 1000,
            min_ms_between_flows: 2 * 60 * 60 * 1000,
        }
    }
}
