//! Health report served on `/health`
//!
//! The supervisor assembles a report on every health tick; the HTTP endpoint
//! serialises the latest one. Healthy and warning map to HTTP 200, critical
//! and unhealthy to 503.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
    Unhealthy,
}

impl HealthLevel {
    fn severity(self) -> u8 {
        match self {
            HealthLevel::Healthy => 0,
            HealthLevel::Warning => 1,
            HealthLevel::Critical => 2,
            HealthLevel::Unhealthy => 3,
        }
    }

    fn worst(levels: impl IntoIterator<Item = HealthLevel>) -> HealthLevel {
        levels
            .into_iter()
            .max_by_key(|l| l.severity())
            .unwrap_or(HealthLevel::Healthy)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub status: HealthLevel,
    pub running: usize,
    pub total: usize,
}

impl WorkerHealth {
    pub fn of(running: usize, total: usize) -> Self {
        let status = if total == 0 || running == total {
            HealthLevel::Healthy
        } else if running == 0 {
            HealthLevel::Critical
        } else {
            HealthLevel::Warning
        };
        Self {
            status,
            running,
            total,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitLoadHealth {
    pub status: HealthLevel,
    pub completed: usize,
    pub running: usize,
    pub total: usize,
}

impl InitLoadHealth {
    pub fn of(completed: usize, running: usize, total: usize) -> Self {
        let status = if completed == total || running > 0 {
            HealthLevel::Healthy
        } else {
            HealthLevel::Warning
        };
        Self {
            status,
            completed,
            running,
            total,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub status: HealthLevel,
    pub depth: usize,
    pub capacity: usize,
    pub dropped: u64,
}

impl QueueHealth {
    pub fn of(depth: usize, capacity: usize, dropped: u64) -> Self {
        let fill = depth as f64 / capacity.max(1) as f64;
        let status = if fill > 0.9 {
            HealthLevel::Critical
        } else if fill > 0.7 || dropped > 0 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };
        Self {
            status,
            depth,
            capacity,
            dropped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthComponents {
    pub sources: WorkerHealth,
    pub targets: WorkerHealth,
    pub init_loads: InitLoadHealth,
    pub message_bus: QueueHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub generated_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: HealthComponents,
}

impl HealthReport {
    pub fn assemble(uptime_seconds: u64, components: HealthComponents) -> Self {
        let status = HealthLevel::worst([
            components.sources.status,
            components.targets.status,
            components.init_loads.status,
            components.message_bus.status,
        ]);
        Self {
            status,
            generated_at: Utc::now(),
            uptime_seconds,
            components,
        }
    }

    /// Report used before the first health tick has run
    pub fn starting() -> Self {
        Self::assemble(
            0,
            HealthComponents {
                sources: WorkerHealth::of(0, 0),
                targets: WorkerHealth::of(0, 0),
                init_loads: InitLoadHealth::of(0, 0, 0),
                message_bus: QueueHealth::of(0, 1, 0),
            },
        )
    }

    pub fn http_status(&self) -> u16 {
        match self.status {
            HealthLevel::Healthy | HealthLevel::Warning => 200,
            HealthLevel::Critical | HealthLevel::Unhealthy => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_health_levels() {
        assert_eq!(WorkerHealth::of(2, 2).status, HealthLevel::Healthy);
        assert_eq!(WorkerHealth::of(1, 2).status, HealthLevel::Warning);
        assert_eq!(WorkerHealth::of(0, 2).status, HealthLevel::Critical);
        assert_eq!(WorkerHealth::of(0, 0).status, HealthLevel::Healthy);
    }

    #[test]
    fn test_queue_health_thresholds() {
        assert_eq!(QueueHealth::of(100, 10_000, 0).status, HealthLevel::Healthy);
        assert_eq!(QueueHealth::of(8_000, 10_000, 0).status, HealthLevel::Warning);
        assert_eq!(QueueHealth::of(9_500, 10_000, 0).status, HealthLevel::Critical);
        // Any drop is at least a warning
        assert_eq!(QueueHealth::of(0, 10_000, 3).status, HealthLevel::Warning);
    }

    #[test]
    fn test_overall_is_worst_component() {
        let report = HealthReport::assemble(
            10,
            HealthComponents {
                sources: WorkerHealth::of(0, 1),
                targets: WorkerHealth::of(1, 1),
                init_loads: InitLoadHealth::of(0, 0, 0),
                message_bus: QueueHealth::of(0, 100, 0),
            },
        );
        assert_eq!(report.status, HealthLevel::Critical);
        assert_eq!(report.http_status(), 503);
    }

    #[test]
    fn test_warning_still_serves_200() {
        let report = HealthReport::assemble(
            10,
            HealthComponents {
                sources: WorkerHealth::of(1, 1),
                targets: WorkerHealth::of(1, 1),
                init_loads: InitLoadHealth::of(0, 0, 2),
                message_bus: QueueHealth::of(0, 100, 0),
            },
        );
        assert_eq!(report.status, HealthLevel::Warning);
        assert_eq!(report.http_status(), 200);
    }

    #[test]
    fn test_report_serializes_lowercase() {
        let report = HealthReport::starting();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["components"]["message_bus"]["capacity"].is_number());
    }
}
