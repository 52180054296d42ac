//! Resource sampling capability
//!
//! The profiler only ever talks to [`ResourceSampler`]. `SystemSampler` reads
//! process CPU and resident memory through sysinfo on every call;
//! `BackgroundSampler` refreshes the same readings on a tokio interval and
//! serves the latest values from atomics so the recording path never waits
//! on a refresh.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sysinfo::{Pid, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::errors::SamplerError;

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Supplies current CPU and memory readings on demand
#[cfg_attr(test, mockall::automock)]
pub trait ResourceSampler: Send + Sync {
    /// Current memory usage in megabytes
    fn current_memory_usage(&self) -> Result<f64, SamplerError>;
    /// Current CPU usage in percent
    fn current_cpu_usage(&self) -> Result<f64, SamplerError>;
}

/// Synchronous sampler for the current process.
///
/// sysinfo needs at least `MINIMUM_CPU_UPDATE_INTERVAL` between refreshes to
/// compute CPU usage, so readings taken closer together than that reuse the
/// previous refresh. A memory read followed by a CPU read therefore comes
/// from one paired sample.
pub struct SystemSampler {
    state: Mutex<SamplerState>,
    pid: Pid,
}

struct SamplerState {
    system: System,
    last: Option<(Instant, (f64, f64))>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::for_pid(std::process::id())
    }

    pub fn for_pid(pid: u32) -> Self {
        Self {
            state: Mutex::new(SamplerState { system: System::new(), last: None }),
            pid: Pid::from_u32(pid),
        }
    }

    /// Return `(cpu_percent, memory_mb)`, refreshing the process entry when
    /// the previous reading is older than the minimum CPU update interval
    pub fn sample(&self) -> Result<(f64, f64), SamplerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SamplerError::Unavailable("sysinfo state poisoned".to_string()))?;

        if let Some((taken_at, reading)) = state.last {
            if taken_at.elapsed() < MINIMUM_CPU_UPDATE_INTERVAL {
                return Ok(reading);
            }
        }

        if !state.system.refresh_process(self.pid) {
            return Err(SamplerError::ProcessNotFound(self.pid.as_u32()));
        }

        let process = state
            .system
            .process(self.pid)
            .ok_or(SamplerError::ProcessNotFound(self.pid.as_u32()))?;
        let reading = (process.cpu_usage() as f64, process.memory() as f64 / BYTES_PER_MB);

        state.last = Some((Instant::now(), reading));
        Ok(reading)
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn current_memory_usage(&self) -> Result<f64, SamplerError> {
        self.sample().map(|(_, memory_mb)| memory_mb)
    }

    fn current_cpu_usage(&self) -> Result<f64, SamplerError> {
        self.sample().map(|(cpu, _)| cpu)
    }
}

/// Latest readings published by the background refresh task
#[derive(Debug, Default)]
struct SharedReadings {
    cpu_bits: AtomicU64,
    memory_bits: AtomicU64,
    has_reading: AtomicBool,
}

impl SharedReadings {
    fn store(&self, cpu: f64, memory_mb: f64) {
        self.cpu_bits.store(cpu.to_bits(), Ordering::Relaxed);
        self.memory_bits.store(memory_mb.to_bits(), Ordering::Relaxed);
        self.has_reading.store(true, Ordering::Release);
    }

    fn load(&self) -> Option<(f64, f64)> {
        if !self.has_reading.load(Ordering::Acquire) {
            return None;
        }
        Some((
            f64::from_bits(self.cpu_bits.load(Ordering::Relaxed)),
            f64::from_bits(self.memory_bits.load(Ordering::Relaxed)),
        ))
    }
}

/// Sampler that refreshes readings off the hot path.
///
/// Readers may observe values up to one refresh interval old.
pub struct BackgroundSampler {
    inner: Arc<SystemSampler>,
    readings: Arc<SharedReadings>,
    running: Arc<AtomicBool>,
}

impl BackgroundSampler {
    pub fn new(inner: SystemSampler) -> Self {
        Self {
            inner: Arc::new(inner),
            readings: Arc::new(SharedReadings::default()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take one reading immediately, outside the background loop
    pub fn refresh_now(&self) -> Result<(), SamplerError> {
        let (cpu, memory_mb) = self.inner.sample()?;
        self.readings.store(cpu, memory_mb);
        Ok(())
    }

    /// Start the refresh loop. Calling this twice is a no-op.
    pub fn start(&self, refresh_interval: Duration) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Background sampler already running");
            return None;
        }

        let inner = self.inner.clone();
        let readings = self.readings.clone();
        let running = self.running.clone();

        info!(interval_ms = refresh_interval.as_millis() as u64, "🔄 Background resource sampler started");

        Some(tokio::spawn(async move {
            let mut ticker = interval(refresh_interval);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                match inner.sample() {
                    Ok((cpu, memory_mb)) => readings.store(cpu, memory_mb),
                    Err(e) => debug!("Resource sample failed, keeping previous reading: {}", e),
                }
            }
            debug!("Background resource sampler stopped");
        }))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl ResourceSampler for BackgroundSampler {
    fn current_memory_usage(&self) -> Result<f64, SamplerError> {
        self.readings
            .load()
            .map(|(_, memory_mb)| memory_mb)
            .ok_or_else(|| SamplerError::Unavailable("no reading collected yet".to_string()))
    }

    fn current_cpu_usage(&self) -> Result<f64, SamplerError> {
        self.readings
            .load()
            .map(|(cpu, _)| cpu)
            .ok_or_else(|| SamplerError::Unavailable("no reading collected yet".to_string()))
    }
}
