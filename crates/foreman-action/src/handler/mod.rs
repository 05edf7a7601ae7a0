//! Capability trait and registry.
//!
//! A capability is the mechanism that actually carries out a plan step
//! (send mail, post an update, write to a ledger). The processing loop only
//! sees the `Capability` trait; configuration picks which registered variant
//! serves each action kind.

pub mod dry_run;
pub mod review;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use foreman_core::config::CapabilityConfig;
use foreman_core::error::ForemanError;

use crate::error::ExecutorError;
use crate::types::{ActionKind, StepOutcome, StepRequest};

pub use dry_run::DryRunCapability;
pub use review::ReviewCapability;

/// An external mechanism that can execute plan steps.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Registry tag used in configuration.
    fn tag(&self) -> &'static str;

    /// Check credentials or connectivity before work starts.
    async fn authenticate(&self) -> bool;

    /// Execute one plan step.
    async fn execute(&self, step: &StepRequest) -> Result<StepOutcome, ExecutorError>;

    /// Metrics about an artifact this capability produced earlier.
    async fn metrics(&self, _reference_id: &str) -> Map<String, Value> {
        Map::new()
    }
}

/// Capabilities by tag.
pub struct CapabilityRegistry {
    capabilities: HashMap<&'static str, Arc<dyn Capability>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register the built-in variants.
    pub fn register_defaults(&mut self) {
        self.register(Arc::new(ReviewCapability));
        self.register(Arc::new(DryRunCapability));
    }

    /// Register a capability, replacing any with the same tag.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities.insert(capability.tag(), capability);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(tag).cloned()
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.capabilities.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Configured tag for an action kind.
    pub fn tag_for(kind: ActionKind, config: &CapabilityConfig) -> &str {
        match kind {
            ActionKind::PlanExecution => &config.plan_execution,
            ActionKind::Generic => &config.generic,
        }
    }

    /// Capability serving `kind` under `config`.
    pub fn select(
        &self,
        kind: ActionKind,
        config: &CapabilityConfig,
    ) -> Option<Arc<dyn Capability>> {
        self.get(Self::tag_for(kind, config))
    }

    /// Every configured tag must name a registered capability.
    pub fn validate(&self, config: &CapabilityConfig) -> Result<(), ForemanError> {
        let missing: Vec<String> = [ActionKind::PlanExecution, ActionKind::Generic]
            .into_iter()
            .map(|kind| (kind, Self::tag_for(kind, config)))
            .filter(|(_, tag)| !self.capabilities.contains_key(*tag))
            .map(|(kind, tag)| format!("capabilities.{} = {:?} is not registered", kind, tag))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ForemanError::Config(format!(
                "{} (available: {})",
                missing.join("; "),
                self.tags().join(", ")
            )))
        }
    }

    /// Authenticate every registered capability; returns the tags that failed.
    pub async fn authenticate_all(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        for tag in self.tags() {
            if let Some(cap) = self.capabilities.get(tag) {
                if !cap.authenticate().await {
                    tracing::warn!(capability = tag, "Capability authentication failed");
                    failed.push(tag);
                }
            }
        }
        failed
    }
}
