use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use tracing::{info, warn};

/// Liveness reporting for the broker clients of the service.
///
/// Every rdkafka client (the producer and each consumer group) runs its own
/// background loop. A client registers here and must report healthy more
/// often than its deadline, which is wired to the configured health-check
/// timeout. The process is live only while every registered component has a
/// fresh report:
///   - a component that never reported is still `Starting`, and not live
///   - a component that reported `Unhealthy` fails the check
///   - a component whose last report is older than its deadline is `Stalled`
///
/// Reports are written straight into the shared map, so handles can be used
/// from librdkafka's callback threads without a runtime.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when every registered component is healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first report
    Starting,
    /// Recently reported healthy, must report again before the instant
    HealthyUntil(Instant),
    /// Reported unhealthy
    Unhealthy,
    /// The HealthyUntil deadline has passed
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => *until > Instant::now(),
            _ => false,
        }
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more frequently than the registered deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        self.components
            .write()
            .insert(self.component.clone(), status);
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component in `Starting` state. The returned handle goes to
    /// the component so it can report its own status.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Combined status of every registered component. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self.components.read();
        let now = Instant::now();

        // No registered component means nothing is running yet
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
                other => *other,
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
