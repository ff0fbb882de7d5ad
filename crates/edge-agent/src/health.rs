//! # Health Probe
//!
//! Source of [`HealthRecord`]s for the state service. [`SysinfoProbe`] reads the host;
//! tests substitute a fixed probe.

use crate::model::HealthRecord;
use chrono::Utc;
use std::path::Path;
use sysinfo::{Disks, System};

pub trait HealthProbe: Send {
    fn sample(&mut self) -> HealthRecord;
}

/// Memory = used / total RAM; disk = 1 - available / total on the root mount (or the
/// first disk when there is no `/`); load = 1-minute load average.
pub struct SysinfoProbe {
    system: System,
    disks: Disks,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
        }
    }

    fn memory_consumed(&mut self) -> f64 {
        self.system.refresh_memory();
        ratio(self.system.used_memory(), self.system.total_memory())
    }

    fn disk_consumed(&mut self) -> f64 {
        self.disks.refresh();
        let root = self
            .disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .or_else(|| self.disks.list().first());
        match root {
            Some(disk) => 1.0 - ratio(disk.available_space(), disk.total_space()),
            None => 0.0,
        }
    }
}

impl HealthProbe for SysinfoProbe {
    fn sample(&mut self) -> HealthRecord {
        HealthRecord {
            timestamp: Utc::now(),
            memory_consumed: self.memory_consumed(),
            disk_consumed: self.disk_consumed(),
            load_average: System::load_average().one,
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
