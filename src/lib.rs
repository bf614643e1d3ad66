//! Wavefront path-tracing scheduler.
//!
//! Drives a render pass as a sequence of per-kernel launches over a fixed pool
//! of path state slots: work tiles are admitted into free slots, queued paths are
//! dispatched kernel by kernel, terminated slots are compacted away, and the film
//! is checked for convergence between sample batches.
//!
//! Rust: wgpu 0.19 compute backend, plus a host reference device for CPU-only runs.

pub mod device;
pub mod error;
pub mod gpu;
pub mod path_tracing;

pub use device::host::{HostDevice, HostDeviceConfig};
pub use device::synthetic::SyntheticKernels;
pub use device::wgpu_backend::{WgpuQueue, WgpuQueueConfig};
pub use device::{DeviceKernel, DevicePtr, DeviceQueue, DeviceVector, KernelArgs};
pub use error::{RenderError, RenderResult};
pub use path_tracing::{
    BufferParams, ConvergenceSampler, DisplayStrategy, DisplayUpdateMode, GpuDisplay,
    IntegratorConfig, RenderBuffers, RenderStatistics, SceneInfo, WavefrontIntegrator,
    WorkTileScheduler,
};
