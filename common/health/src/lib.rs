use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

/// Health reporting for the asynchronous components of a service process.
///
/// The server contains several long-lived loops (HTTP handlers, the timeout
/// reaper), and the process can only be trusted with work if all of them are
/// running and reporting. `HealthRegistry` lets an arbitrary number of
/// components register and report their status. The process status is the
/// combination of the individual ones:
///   - if any component is unhealthy, the process is unhealthy
///   - if all components recently reported healthy, the process is healthy
///   - if a component failed to report within its deadline, it is considered
///     stalled and the check fails
///
/// Liveness and readiness probes should each use their own registry instance.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the status code from the overall health, and prints each
    /// component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(DateTime<Utc>),
    /// Reported unhealthy
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

/// Handed to a component on registration, to report with.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report as healthy. Must be called more frequently than the deadline
    /// configured at registration.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: just warn, the probes will fail and the process restart
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a new component. The returned handle should be passed to the
    /// component, to allow it to frequently report its health status.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Returns the overall process status, computed from the status of all
    /// registered components. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        let mut result = HealthStatus {
            healthy: !components.is_empty(), // unhealthy if no component has registered yet
            components: Default::default(),
        };
        let now = Utc::now();

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    result.healthy = false;
                    result.components.insert(name.clone(), status.clone());
                }
            }
        }
        if !result.healthy {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn one_component() {
        let registry = HealthRegistry::new("liveness");

        // New components are registered in Starting
        let handle = registry.register("one".to_string(), Duration::seconds(30));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("one"),
            Some(&ComponentStatus::Starting)
        );

        // Status goes healthy once the component reports
        handle.report_healthy();
        let status = registry.get_status();
        assert!(status.healthy);
        assert_eq!(status.components.len(), 1);

        // Status goes unhealthy if the component says so
        handle.report_status(ComponentStatus::Unhealthy);
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("one"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[test]
    fn staleness_check() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("one".to_string(), Duration::seconds(30));

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        // If the component's ping is too old, it is considered stalled
        handle.report_status(ComponentStatus::HealthyUntil(
            Utc::now() - Duration::seconds(1),
        ));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("one"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn several_components() {
        let registry = HealthRegistry::new("liveness");
        let handle1 = registry.register("one".to_string(), Duration::seconds(30));
        let handle2 = registry.register("two".to_string(), Duration::seconds(30));

        // First component going healthy is not enough
        handle1.report_healthy();
        assert!(!registry.get_status().healthy);

        // Second component going healthy brings the health to green
        handle2.report_healthy();
        assert!(registry.get_status().healthy);

        // Any component going unhealthy takes the health down
        handle1.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);

        handle1.report_healthy();
        assert!(registry.get_status().healthy);
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
