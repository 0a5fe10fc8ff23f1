//! Host load figures for the status line.
//!
//! CPU percentages are measured between two samples, so the first
//! sample after construction reads zero.

use sysinfo::{Pid, System};
use tracing::debug;

/// One reading of system and process load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSample {
    /// Whole-machine CPU use, 0-100.
    pub system_cpu_percent: f32,
    /// This process, 0-100 per core.
    pub process_cpu_percent: f32,
    /// Physical memory in use on the machine, bytes.
    pub memory_used: u64,
    pub memory_total: u64,
    /// Resident set of this process, bytes.
    pub process_memory: u64,
    pub process_virtual_memory: u64,
}

pub struct SystemMetrics {
    system: System,
    pid: Option<Pid>,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!(error = e, "process metrics unavailable");
                None
            }
        };
        let mut metrics = Self {
            system: System::new(),
            pid,
        };
        // Prime the CPU counters.
        metrics.refresh();
        metrics
    }

    pub fn sample(&mut self) -> MetricsSample {
        self.refresh();
        let mut sample = MetricsSample {
            system_cpu_percent: self.system.global_cpu_info().cpu_usage(),
            memory_used: self.system.used_memory(),
            memory_total: self.system.total_memory(),
            ..MetricsSample::default()
        };
        if let Some(process) = self.pid.and_then(|pid| self.system.process(pid)) {
            sample.process_cpu_percent = process.cpu_usage();
            sample.process_memory = process.memory();
            sample.process_virtual_memory = process.virtual_memory();
        }
        sample
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        if let Some(pid) = self.pid {
            self.system.refresh_process(pid);
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}
