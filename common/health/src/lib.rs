//! Liveness reporting for the long-running loops of the ingestion services.
//!
//! Each loop registers itself as a component and must keep reporting healthy
//! before its deadline runs out. The process is live only when every
//! registered component is: a component that never reported, reported
//! unhealthy, stopped, or let its deadline pass fails the probe.
use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Must report again before the deadline.
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Shut down on purpose, e.g. after a cancellation.
    Stopped,
    /// Set when reading a `HealthyUntil` deadline that already passed.
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, body).into_response()
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

/// Handle given to a single component so it can report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Report healthy until now + the deadline given at registration.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // The probe reads through the same lock and will fail too.
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
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

    /// Register a component in `Starting` state and return its handle.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Combined status of every registered component. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned registry lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        // No component registered yet means nothing is running.
        let mut healthy = !components.is_empty();
        let mut statuses = HashMap::with_capacity(components.len());

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => {
                    healthy = false;
                    ComponentStatus::Stalled
                }
                other => {
                    healthy = false;
                    other.clone()
                }
            };
            statuses.insert(name.clone(), status);
        }

        if healthy {
            info!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, statuses);
        }

        HealthStatus {
            healthy,
            components: statuses,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Sub;

    use super::*;

    #[test]
    fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn consume_loop_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("consume_loop", Duration::seconds(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consume_loop"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Stopped);
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consume_loop"),
            Some(&ComponentStatus::Stopped)
        );
    }

    #[test]
    fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("consume_loop", Duration::seconds(30));

        handle.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().sub(Duration::seconds(1)),
        ));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consume_loop"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn every_component_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry.register("consume_loop", Duration::seconds(30));
        let store = registry.register("record_store", Duration::seconds(30));

        consumer.report_healthy();
        assert!(!registry.get_status().healthy);

        store.report_healthy();
        assert!(registry.get_status().healthy);

        store.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
