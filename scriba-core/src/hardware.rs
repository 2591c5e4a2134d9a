//! Hardware probe — detects an accelerator once at startup and derives the
//! policy every other component consults.
//!
//! The probe is deliberately boring: one `nvidia-smi` attempt, environment
//! overrides for tests and operators, CPU fallback on any failure. It must
//! never be fatal and never block on a secondary probe.

use std::process::Command;
use std::sync::OnceLock;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chunk::SeparationTier;

/// Accelerator memory (MiB) needed for the heavy separator tier.
const HEAVY_TIER_MIN_MB: u64 = 8 * 1024;
/// Accelerator memory (MiB) needed for the light separator tier.
const LIGHT_TIER_MIN_MB: u64 = 4 * 1024;

/// What the machine offers.
#[derive(Debug, Clone, Serialize)]
pub struct HardwareProfile {
    pub has_accelerator: bool,
    pub accelerator_name: Option<String>,
    pub accelerator_memory_mb: u64,
    pub cpu_cores: usize,
}

/// Which compute device a model should load on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    Accelerator,
    Cpu,
}

/// Policy derived from the profile; drives separation tiering and the
/// scheduler's concurrency cap.
#[derive(Debug, Clone, Serialize)]
pub struct HardwarePolicy {
    pub primary_device: ComputeDevice,
    pub enable_separation: bool,
    pub separator_tier: Option<SeparationTier>,
    pub concurrency: usize,
    /// Set when the accelerator has enough headroom for two resident models;
    /// the model manager relaxes its single-resident rule in that case.
    pub both_models_fit: bool,
}

impl HardwareProfile {
    /// Derive the recommended policy. Separation tiers by accelerator memory:
    /// heavy at >= 8 GiB, light at >= 4 GiB, disabled below.
    pub fn policy(&self) -> HardwarePolicy {
        let separator_tier = if !self.has_accelerator {
            None
        } else if self.accelerator_memory_mb >= HEAVY_TIER_MIN_MB {
            Some(SeparationTier::Heavy)
        } else if self.accelerator_memory_mb >= LIGHT_TIER_MIN_MB {
            Some(SeparationTier::Light)
        } else {
            None
        };

        HardwarePolicy {
            primary_device: if self.has_accelerator {
                ComputeDevice::Accelerator
            } else {
                ComputeDevice::Cpu
            },
            enable_separation: separator_tier.is_some(),
            separator_tier,
            concurrency: 1,
            both_models_fit: self.accelerator_memory_mb >= 2 * HEAVY_TIER_MIN_MB,
        }
    }

    fn cpu_only() -> Self {
        Self {
            has_accelerator: false,
            accelerator_name: None,
            accelerator_memory_mb: 0,
            cpu_cores: available_cores(),
        }
    }
}

/// Detect hardware once; later calls return the memoized profile.
pub fn detect() -> &'static HardwareProfile {
    static PROFILE: OnceLock<HardwareProfile> = OnceLock::new();
    PROFILE.get_or_init(|| {
        let profile = probe();
        info!(
            has_accelerator = profile.has_accelerator,
            accelerator = profile.accelerator_name.as_deref().unwrap_or("none"),
            memory_mb = profile.accelerator_memory_mb,
            cpu_cores = profile.cpu_cores,
            "hardware probe complete"
        );
        profile
    })
}

fn probe() -> HardwareProfile {
    if std::env::var("SCRIBA_FORCE_CPU").map(|v| v == "1").unwrap_or(false) {
        debug!("SCRIBA_FORCE_CPU=1 — skipping accelerator probe");
        return HardwareProfile::cpu_only();
    }

    // Operator override, mostly for tests and container deployments where
    // nvidia-smi is not on PATH.
    if let Ok(raw) = std::env::var("SCRIBA_ACCEL_MEMORY_MB") {
        if let Ok(mb) = raw.trim().parse::<u64>() {
            return HardwareProfile {
                has_accelerator: mb > 0,
                accelerator_name: (mb > 0).then(|| "override".to_string()),
                accelerator_memory_mb: mb,
                cpu_cores: available_cores(),
            };
        }
        warn!(raw, "unparseable SCRIBA_ACCEL_MEMORY_MB — ignoring");
    }

    match probe_nvidia() {
        Some((name, memory_mb)) => HardwareProfile {
            has_accelerator: true,
            accelerator_name: Some(name),
            accelerator_memory_mb: memory_mb,
            cpu_cores: available_cores(),
        },
        None => HardwareProfile::cpu_only(),
    }
}

/// One-shot `nvidia-smi` query. Any failure (missing binary, bad output)
/// means "no accelerator".
fn probe_nvidia() -> Option<(String, u64)> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().next()?;
    let (name, mem) = line.rsplit_once(',')?;
    let memory_mb = mem.trim().parse::<u64>().ok()?;
    Some((name.trim().to_string(), memory_mb))
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
