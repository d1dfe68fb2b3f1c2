use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub since: DateTime<Utc>,
}

/// Overall process health: the worst component status wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Shared registry that components report their health into.
///
/// Cloning shares the same registry.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, component: &str) {
        self.set(component, HealthStatus::Healthy, None);
    }

    pub fn set_degraded(&self, component: &str, detail: impl Into<String>) {
        self.set(component, HealthStatus::Degraded, Some(detail.into()));
    }

    pub fn status_of(&self, component: &str) -> Option<HealthStatus> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(component).map(|c| c.status)
    }

    pub fn report(&self) -> HealthReport {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let status = map
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        HealthReport {
            status,
            components: map.clone(),
        }
    }

    fn set(&self, component: &str, status: HealthStatus, detail: Option<String>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        // Keep `since` stable while the status does not change.
        if let Some(existing) = map.get_mut(component) {
            if existing.status == status {
                existing.detail = detail;
                return;
            }
        }
        map.insert(
            component.to_string(),
            ComponentHealth {
                status,
                detail,
                since: Utc::now(),
            },
        );
    }
}
