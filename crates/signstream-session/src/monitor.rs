//! Per-session resource monitoring and soft-limit enforcement

use signstream_core::config::ResourceLimitsConfig;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// One resource observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
}

/// What the pipeline should do after a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementAction {
    None,
    /// Soft ceiling breached repeatedly; downgrade the quality profile.
    Downgrade,
}

pub struct ResourceMonitor {
    limits: ResourceLimitsConfig,
    system: System,
    pid: Option<Pid>,
    consecutive_violations: u32,
    enforcement_events: u64,
    last_sample: ResourceSample,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimitsConfig) -> Self {
        Self {
            limits,
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            consecutive_violations: 0,
            enforcement_events: 0,
            last_sample: ResourceSample::default(),
        }
    }

    /// Refresh process CPU/memory readings. Called from the adaptation tick,
    /// not per frame; per-frame metrics reuse the cached sample.
    pub fn sample(&mut self) -> ResourceSample {
        let Some(pid) = self.pid else {
            return self.last_sample;
        };
        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        if let Some(process) = self.system.process(pid) {
            let total = self.system.total_memory();
            let memory_bytes = process.memory();
            self.last_sample = ResourceSample {
                cpu_percent: process.cpu_usage() as f64,
                memory_mb: memory_bytes as f64 / (1024.0 * 1024.0),
                memory_percent: if total > 0 {
                    memory_bytes as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
            };
        }
        self.last_sample
    }

    pub fn cached(&self) -> ResourceSample {
        self.last_sample
    }

    /// Check the cached sample against the soft ceilings. Enforcement fires
    /// after `violation_threshold` consecutive violations and resets.
    pub fn check_limits(&mut self) -> EnforcementAction {
        let sample = self.last_sample;
        let over_memory = sample.memory_mb > self.limits.max_memory_mb as f64;
        let over_cpu = sample.cpu_percent > self.limits.max_cpu_percent;

        if !(over_memory || over_cpu) {
            self.consecutive_violations = 0;
            return EnforcementAction::None;
        }

        self.consecutive_violations += 1;
        debug!(
            violations = self.consecutive_violations,
            cpu = sample.cpu_percent,
            memory_mb = sample.memory_mb,
            "resource limit violation"
        );

        if self.consecutive_violations >= self.limits.violation_threshold {
            self.consecutive_violations = 0;
            self.enforcement_events += 1;
            warn!(
                events = self.enforcement_events,
                cpu = sample.cpu_percent,
                memory_mb = sample.memory_mb,
                "resource limits enforced"
            );
            return EnforcementAction::Downgrade;
        }
        EnforcementAction::None
    }

    pub fn enforcement_events(&self) -> u64 {
        self.enforcement_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforcement_needs_consecutive_violations() {
        let mut monitor = ResourceMonitor::new(ResourceLimitsConfig {
            max_memory_mb: 1,
            max_cpu_percent: 0.0,
            violation_threshold: 3,
        });
        monitor.last_sample = ResourceSample {
            cpu_percent: 50.0,
            memory_mb: 100.0,
            memory_percent: 10.0,
        };

        assert_eq!(monitor.check_limits(), EnforcementAction::None);
        assert_eq!(monitor.check_limits(), EnforcementAction::None);
        assert_eq!(monitor.check_limits(), EnforcementAction::Downgrade);
        // counter reset after enforcement
        assert_eq!(monitor.check_limits(), EnforcementAction::None);
    }

    #[test]
    fn healthy_sample_resets_violations() {
        let mut monitor = ResourceMonitor::new(ResourceLimitsConfig {
            max_memory_mb: 512,
            max_cpu_percent: 80.0,
            violation_threshold: 2,
        });
        monitor.last_sample = ResourceSample {
            cpu_percent: 95.0,
            memory_mb: 100.0,
            memory_percent: 10.0,
        };
        assert_eq!(monitor.check_limits(), EnforcementAction::None);

        monitor.last_sample = ResourceSample::default();
        assert_eq!(monitor.check_limits(), EnforcementAction::None);

        monitor.last_sample = ResourceSample {
            cpu_percent: 95.0,
            memory_mb: 100.0,
            memory_percent: 10.0,
        };
        // streak restarted, one violation is not enough
        assert_eq!(monitor.check_limits(), EnforcementAction::None);
    }
}
