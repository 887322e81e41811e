/// Host telemetry reported by agents in their heartbeats.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuSnapshot {
    pub usage_percent: f32,
    pub cores: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSnapshot {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSnapshot {
    pub interfaces: usize,
    pub received_bytes: u64,
    pub transmitted_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsSnapshot {
    pub name: String,
    pub version: String,
    pub hostname: String,
    pub arch: String,
}

/// CPU, memory, disk, network and OS summary at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cpu: CpuSnapshot,
    #[serde(default)]
    pub memory: MemorySnapshot,
    #[serde(default)]
    pub disks: Vec<DiskSnapshot>,
    #[serde(default)]
    pub network: NetworkSnapshot,
    #[serde(default)]
    pub os: OsSnapshot,
}

impl SystemSnapshot {
    /// Snapshot with only the timestamp and OS identity filled in.
    pub fn minimal() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu: CpuSnapshot::default(),
            memory: MemorySnapshot::default(),
            disks: Vec::new(),
            network: NetworkSnapshot::default(),
            os: os_snapshot(),
        }
    }
}

/// Keeps a `System` around so CPU usage is measured between two refreshes.
pub struct TelemetryCollector {
    system: System,
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }

    pub fn snapshot(&mut self) -> SystemSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory();
        let used_memory = self.system.used_memory();
        let memory = MemorySnapshot {
            total_bytes: total_memory,
            used_bytes: used_memory,
            available_bytes: self.system.available_memory(),
            usage_percent: percent(used_memory, total_memory),
        };

        let cpu = CpuSnapshot {
            usage_percent: self.system.global_cpu_usage(),
            cores: self.system.cpus().len(),
        };

        let disks = Disks::new_with_refreshed_list()
            .iter()
            .map(|disk| DiskSnapshot {
                mount_point: disk.mount_point().display().to_string(),
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
            .collect();

        let networks = Networks::new_with_refreshed_list();
        let network = networks.iter().fold(
            NetworkSnapshot::default(),
            |mut acc, (_name, data)| {
                acc.interfaces += 1;
                acc.received_bytes += data.total_received();
                acc.transmitted_bytes += data.total_transmitted();
                acc
            },
        );

        SystemSnapshot {
            timestamp: Utc::now(),
            cpu,
            memory,
            disks,
            network,
            os: os_snapshot(),
        }
    }
}

fn os_snapshot() -> OsSnapshot {
    OsSnapshot {
        name: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
        version: System::os_version().unwrap_or_default(),
        hostname: System::host_name().unwrap_or_default(),
        arch: std::env::consts::ARCH.to_string(),
    }
}

fn percent(part: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64 * 100.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_has_identity() {
        let mut collector = TelemetryCollector::new();
        let snapshot = collector.snapshot();
        assert!(!snapshot.os.arch.is_empty());
        assert!(snapshot.cpu.cores >= 1);
        assert!(snapshot.memory.usage_percent <= 100.0);
    }

    #[test]
    fn test_percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}
