//! Process-level execution settings.

use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Device;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("could not start worker threads")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Compute device and worker threads, built once at startup and handed
/// to the workflows.
pub struct Runtime {
    device: Device,
    host_device_count: usize,
    pool: ThreadPool,
}

impl Runtime {
    /// `host_device_count` is the number of chains that can run at once.
    pub fn new(device: Device, host_device_count: usize) -> Result<Self, RuntimeError> {
        if device == Device::Gpu {
            warn!("GPU execution is not available, running on the CPU");
        }
        let host_device_count = host_device_count.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(host_device_count)
            .thread_name(|idx| format!("chain-worker-{idx}"))
            .build()?;
        debug!(?device, host_device_count, "runtime ready");
        Ok(Runtime {
            device,
            host_device_count,
            pool,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn host_device_count(&self) -> usize {
        self.host_device_count
    }

    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}
