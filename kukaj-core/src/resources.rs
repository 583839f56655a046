use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ResourcesSection;
use crate::job::{JobError, JobResult};

/// One reading of host pressure. `degraded` marks a sample where probing
/// failed and the limits could not be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub degraded: bool,
}

impl ResourceSample {
    pub fn degraded() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            degraded: true,
        }
    }
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> io::Result<ResourceSample>;
}

/// Admission gate evaluated once per job, before any browser session is
/// opened. Probe failures fail open: a host we cannot measure still
/// accepts work, flagged as degraded.
pub struct ResourceMonitor {
    probe: Box<dyn ResourceProbe>,
    limits: ResourcesSection,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn ResourceProbe>, limits: ResourcesSection) -> Self {
        Self { probe, limits }
    }

    pub fn system(limits: ResourcesSection) -> Self {
        let probe = SystemResourceProbe::new(Path::new(&limits.disk_path));
        Self::new(Box::new(probe), limits)
    }

    pub async fn check_admission(&self) -> JobResult<ResourceSample> {
        let sample = match tokio::time::timeout(self.limits.sample_timeout(), self.probe.sample())
            .await
        {
            Ok(Ok(sample)) => sample,
            Ok(Err(err)) => {
                warn!(error = %err, "resource probe failed, admitting degraded");
                return Ok(ResourceSample::degraded());
            }
            Err(_) => {
                warn!("resource probe timed out, admitting degraded");
                return Ok(ResourceSample::degraded());
            }
        };

        if sample.cpu_percent > self.limits.cpu_limit_percent {
            return Err(JobError::ResourceExhausted {
                detail: format!(
                    "cpu at {:.1}% exceeds {:.1}% limit",
                    sample.cpu_percent, self.limits.cpu_limit_percent
                ),
            });
        }
        if sample.memory_percent > self.limits.memory_limit_percent {
            return Err(JobError::ResourceExhausted {
                detail: format!(
                    "memory at {:.1}% exceeds {:.1}% limit",
                    sample.memory_percent, self.limits.memory_limit_percent
                ),
            });
        }
        if sample.disk_percent > self.limits.disk_limit_percent {
            return Err(JobError::ResourceExhausted {
                detail: format!(
                    "disk at {:.1}% exceeds {:.1}% limit",
                    sample.disk_percent, self.limits.disk_limit_percent
                ),
            });
        }
        debug!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            disk = sample.disk_percent,
            "resource admission passed"
        );
        Ok(sample)
    }
}

/// Linux probe reading `/proc/stat` and `/proc/meminfo`, with disk usage
/// taken from `df -P` on the downloads directory.
pub struct SystemResourceProbe {
    disk_path: PathBuf,
}

impl SystemResourceProbe {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
        }
    }

    async fn cpu_percent(&self) -> io::Result<f64> {
        let first = read_cpu_times().await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = read_cpu_times().await?;
        let total = second.total.saturating_sub(first.total);
        let idle = second.idle.saturating_sub(first.idle);
        if total == 0 {
            return Ok(0.0);
        }
        Ok(100.0 * (total - idle) as f64 / total as f64)
    }

    async fn memory_percent(&self) -> io::Result<f64> {
        let content = tokio::fs::read_to_string("/proc/meminfo").await?;
        let total = meminfo_kb(&content, "MemTotal:");
        let available = meminfo_kb(&content, "MemAvailable:");
        match (total, available) {
            (Some(total), Some(available)) if total > 0 => {
                Ok(100.0 * (total - available.min(total)) as f64 / total as f64)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "meminfo missing MemTotal/MemAvailable",
            )),
        }
    }

    async fn disk_percent(&self) -> io::Result<f64> {
        let output = Command::new("df")
            .arg("-P")
            .arg(&self.disk_path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("df exited with {}", output.status),
            ));
        }
        parse_df_use_percent(&output.stdout).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unparseable df output")
        })
    }
}

#[async_trait]
impl ResourceProbe for SystemResourceProbe {
    async fn sample(&self) -> io::Result<ResourceSample> {
        let cpu_percent = self.cpu_percent().await?;
        let memory_percent = self.memory_percent().await?;
        let disk_percent = self.disk_percent().await?;
        Ok(ResourceSample {
            cpu_percent,
            memory_percent,
            disk_percent,
            degraded: false,
        })
    }
}

struct CpuTimes {
    total: u64,
    idle: u64,
}

async fn read_cpu_times() -> io::Result<CpuTimes> {
    let content = tokio::fs::read_to_string("/proc/stat").await?;
    let line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no cpu line in /proc/stat"))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|field| field.parse().ok())
        .collect();
    if fields.len() < 5 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "short cpu line in /proc/stat",
        ));
    }
    let total = fields.iter().sum();
    // idle + iowait
    let idle = fields[3] + fields[4];
    Ok(CpuTimes { total, idle })
}

fn meminfo_kb(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn parse_df_use_percent(stdout: &[u8]) -> Option<f64> {
    let output = String::from_utf8_lossy(stdout);
    let regex = Regex::new(r"(\d+)%").expect("valid regex");
    let last_line = output.lines().last()?;
    regex
        .captures(last_line)
        .and_then(|cap| cap.get(1))
        .and_then(|value| value.as_str().parse().ok())
}
