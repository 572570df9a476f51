//! Accelerator tracking and load-balanced allocation
//!
//! The device manager owns the table of accelerators, hands out
//! per-use allocations to workers and reclaims allocations left behind
//! by crashed workers. Allocation failure is a normal outcome: callers
//! fall back to CPU or requeue, they do not treat `None` as an error.
//!
//! Allocation counters are written synchronously under the manager
//! lock; the derived utilization and free-memory fields are written
//! only by the periodic refresh task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::DeviceConfig;

/// Device identifier
pub type DeviceId = u32;

/// Availability of one accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    /// Has capacity for more sessions
    Available,
    /// At its concurrency cap
    Busy,
    /// Failed its last refresh
    Error,
    /// Not visible to the runtime
    Offline,
}

/// Static description of an accelerator, produced by detection
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    /// Device id
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Total memory in bytes
    pub total_memory: u64,
}

/// Enumerates accelerators present on the host
///
/// The concrete probe (NVML, runtime query) lives outside the core;
/// tests use a static probe.
pub trait DeviceProbe: Send + Sync {
    /// List visible accelerators. An empty list means CPU-only mode.
    fn probe(&self) -> Vec<DeviceSpec>;
}

/// Probe returning a fixed device list
pub struct StaticProbe {
    devices: Vec<DeviceSpec>,
}

impl StaticProbe {
    /// Create a probe over the given devices
    pub fn new(devices: Vec<DeviceSpec>) -> Self {
        Self { devices }
    }

    /// Probe reporting no accelerators
    pub fn none() -> Self {
        Self { devices: vec![] }
    }
}

impl DeviceProbe for StaticProbe {
    fn probe(&self) -> Vec<DeviceSpec> {
        self.devices.clone()
    }
}

/// Live record of one accelerator
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    /// Device id
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Current status
    pub status: DeviceStatus,
    /// Total memory in bytes
    pub total_memory: u64,
    /// Memory reserved by active allocations, in bytes
    pub used_memory: u64,
    /// Free memory in bytes
    pub free_memory: u64,
    /// Utilization estimate in [0, 1], written by the refresh task
    pub utilization: f32,
    /// Active session uses
    pub active_sessions: usize,
    /// Seconds since the last refresh
    #[serde(skip)]
    pub last_refreshed: Instant,
}

impl DeviceRecord {
    fn from_spec(spec: &DeviceSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name.clone(),
            status: DeviceStatus::Available,
            total_memory: spec.total_memory,
            used_memory: 0,
            free_memory: spec.total_memory,
            utilization: 0.0,
            active_sessions: 0,
            last_refreshed: Instant::now(),
        }
    }
}

/// One outstanding device allocation
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Session-use id the allocation belongs to
    pub use_id: String,
    /// Device the allocation is pinned to
    pub device_id: DeviceId,
    /// Memory reserved in bytes
    pub memory: u64,
    /// When the allocation was made
    pub allocated_at: Instant,
    /// Caller's estimate of how long the use should take
    pub estimated_duration: Duration,
}

impl Allocation {
    /// Whether the allocation has outlived its expected duration by
    /// more than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.allocated_at.elapsed() > self.estimated_duration + max_age
    }
}

struct DeviceTable {
    devices: HashMap<DeviceId, DeviceRecord>,
    allocations: HashMap<String, Allocation>,
}

/// Tracks accelerators and hands out allocations
pub struct DeviceManager {
    config: DeviceConfig,
    table: Mutex<DeviceTable>,
}

impl DeviceManager {
    /// Build a manager over the devices reported by `probe`.
    ///
    /// An empty probe result is not a failure: the manager starts in
    /// CPU-only mode and every `allocate` call returns `None`.
    pub fn detect(config: DeviceConfig, probe: &dyn DeviceProbe) -> Arc<Self> {
        let specs = probe.probe();
        if specs.is_empty() {
            info!("no accelerators detected, running in CPU-only mode");
        } else {
            info!(count = specs.len(), "detected accelerators");
        }

        let devices = specs
            .iter()
            .map(|spec| (spec.id, DeviceRecord::from_spec(spec)))
            .collect();

        Arc::new(Self {
            config,
            table: Mutex::new(DeviceTable {
                devices,
                allocations: HashMap::new(),
            }),
        })
    }

    /// Whether any accelerator is present
    pub fn has_devices(&self) -> bool {
        !self.table.lock().unwrap().devices.is_empty()
    }

    /// Allocate a device for one session use.
    ///
    /// Picks the qualifying device with the lowest utilization,
    /// tie-broken by most free memory. Returns `None` when no device
    /// has both free capacity and headroom; the caller decides whether
    /// to fall back to CPU or requeue.
    pub fn allocate(
        &self,
        use_id: &str,
        est_memory: u64,
        est_duration: Duration,
    ) -> Option<DeviceId> {
        let mut table = self.table.lock().unwrap();

        if table.allocations.contains_key(use_id) {
            warn!(use_id, "duplicate allocation request ignored");
            return table.allocations.get(use_id).map(|a| a.device_id);
        }

        let cap = self.config.max_sessions_per_device;
        let headroom = self.config.memory_headroom;
        let best = table
            .devices
            .values()
            .filter(|d| {
                matches!(d.status, DeviceStatus::Available)
                    && d.active_sessions < cap
                    && d.free_memory >= est_memory.saturating_add(headroom)
            })
            .min_by(|a, b| {
                a.utilization
                    .partial_cmp(&b.utilization)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.free_memory.cmp(&a.free_memory))
            })
            .map(|d| d.id)?;

        if let Some(device) = table.devices.get_mut(&best) {
            device.active_sessions += 1;
            device.used_memory += est_memory;
            device.free_memory = device.total_memory.saturating_sub(device.used_memory);
            if device.active_sessions >= cap {
                device.status = DeviceStatus::Busy;
            }
        }

        table.allocations.insert(
            use_id.to_string(),
            Allocation {
                use_id: use_id.to_string(),
                device_id: best,
                memory: est_memory,
                allocated_at: Instant::now(),
                estimated_duration: est_duration,
            },
        );

        debug!(use_id, device = best, "allocated device");
        Some(best)
    }

    /// Release an allocation. Idempotent: unknown ids are a no-op
    /// returning `false`.
    pub fn release(&self, use_id: &str) -> bool {
        let mut table = self.table.lock().unwrap();
        let Some(alloc) = table.allocations.remove(use_id) else {
            return false;
        };

        if let Some(device) = table.devices.get_mut(&alloc.device_id) {
            device.active_sessions = device.active_sessions.saturating_sub(1);
            device.used_memory = device.used_memory.saturating_sub(alloc.memory);
            device.free_memory = device.total_memory.saturating_sub(device.used_memory);
            if device.active_sessions < self.config.max_sessions_per_device
                && device.status == DeviceStatus::Busy
            {
                device.status = DeviceStatus::Available;
            }
        }

        debug!(use_id, device = alloc.device_id, "released device");
        true
    }

    /// Release allocations whose age exceeds their estimate plus
    /// `max_age`, recovering from workers that crashed without
    /// releasing. Returns the number reclaimed.
    pub fn reclaim_expired(&self, max_age: Duration) -> usize {
        let stale: Vec<String> = {
            let table = self.table.lock().unwrap();
            table
                .allocations
                .values()
                .filter(|a| a.is_stale(max_age))
                .map(|a| a.use_id.clone())
                .collect()
        };

        for use_id in &stale {
            warn!(use_id, "reclaiming stale allocation");
            self.release(use_id);
        }
        stale.len()
    }

    /// Reclaim with the manager's own configured maximum age
    pub fn reclaim_stale(&self) -> usize {
        self.reclaim_expired(self.config.max_allocation_age)
    }

    /// Recompute each device's utilization and free memory.
    ///
    /// This is the only writer of the derived fields; the refresh task
    /// calls it on a fixed interval.
    pub fn refresh(&self) {
        let mut table = self.table.lock().unwrap();
        let cap = self.config.max_sessions_per_device;
        for device in table.devices.values_mut() {
            if device.status == DeviceStatus::Offline {
                continue;
            }
            let session_load = device.active_sessions as f32 / cap as f32;
            let memory_load = if device.total_memory > 0 {
                device.used_memory as f32 / device.total_memory as f32
            } else {
                0.0
            };
            device.utilization = (0.6 * session_load + 0.4 * memory_load).clamp(0.0, 1.0);
            device.free_memory = device.total_memory.saturating_sub(device.used_memory);
            device.last_refreshed = Instant::now();
        }
    }

    /// Spawn the periodic refresh task. The handle is aborted by the
    /// owning scheduler on shutdown.
    pub fn start_refresh(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.refresh_interval;
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.refresh();
            }
        })
    }

    /// Snapshot of every device record
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let table = self.table.lock().unwrap();
        let mut records: Vec<DeviceRecord> = table.devices.values().cloned().collect();
        records.sort_by_key(|d| d.id);
        records
    }

    /// Number of outstanding allocations
    pub fn active_allocations(&self) -> usize {
        self.table.lock().unwrap().allocations.len()
    }

    /// Configured per-device concurrency cap
    pub fn session_cap(&self) -> usize {
        self.config.max_sessions_per_device
    }
}
