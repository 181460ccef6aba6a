//! Component health tracking.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Health of one component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Working normally
    Healthy,
    /// Working, but under pressure
    Degraded(String),
    /// Not working
    Unhealthy(String),
    /// Not yet checked
    Unknown,
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every component healthy
    Healthy,
    /// At least one component degraded
    Degraded,
    /// At least one component unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Serializable health summary.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Whether the layer is accepting traffic
    pub serving: bool,
    /// Seconds since the registry was created
    pub uptime_seconds: u64,
    /// Per-component status
    pub components: BTreeMap<String, ComponentStatus>,
}

/// Registry of component statuses.
pub struct HealthCheck {
    components: RwLock<BTreeMap<String, ComponentStatus>>,
    started_at: Instant,
    serving: AtomicBool,
}

impl HealthCheck {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(BTreeMap::new()),
            started_at: Instant::now(),
            serving: AtomicBool::new(false),
        }
    }

    /// Track a component, initially unknown.
    pub fn register_component(&self, name: &str) {
        self.set(name, ComponentStatus::Unknown);
    }

    /// Mark a component healthy.
    pub fn mark_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy);
    }

    /// Mark a component degraded.
    pub fn mark_degraded(&self, name: &str, reason: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded(reason.into()));
    }

    /// Mark a component unhealthy.
    pub fn mark_unhealthy(&self, name: &str, reason: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy(reason.into()));
    }

    /// Set a component's status.
    pub fn set(&self, name: &str, status: ComponentStatus) {
        self.components.write().insert(name.to_string(), status);
    }

    /// Status of one component.
    pub fn component_status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().get(name).cloned()
    }

    /// All component statuses, ordered by name.
    pub fn all_statuses(&self) -> BTreeMap<String, ComponentStatus> {
        self.components.read().clone()
    }

    /// Worst status across components.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => degraded = true,
                ComponentStatus::Healthy | ComponentStatus::Unknown => {}
            }
        }

        if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        self.overall_status() != HealthStatus::Unhealthy
    }

    /// Record that traffic is being accepted.
    pub fn mark_serving(&self) {
        self.serving.store(true, Ordering::SeqCst);
    }

    /// Record that traffic is no longer accepted.
    pub fn mark_stopped(&self) {
        self.serving.store(false, Ordering::SeqCst);
    }

    /// Whether traffic is being accepted.
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Time since creation.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Summary for the health endpoint.
    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            serving: self.is_serving(),
            uptime_seconds: self.uptime().as_secs(),
            components: self.all_statuses(),
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
