// src/gpu.rs
// Process-wide wgpu adapter, device and queue, created on first use

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::error::{RenderError, RenderResult};

pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter: wgpu::Adapter,
}

static CTX: OnceCell<GpuContext> = OnceCell::new();

/// Shared context, or a device error when no adapter is available
pub fn try_ctx() -> RenderResult<&'static GpuContext> {
    CTX.get_or_try_init(|| {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| RenderError::device("No suitable GPU adapter"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                label: Some("forge3d-wavefront-device"),
            },
            None,
        ))
        .map_err(|err| RenderError::device(format!("request_device failed: {err}")))?;

        log::info!("GPU adapter: {:?}", adapter.get_info());
        Ok(GpuContext {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter,
        })
    })
}

/// Round a byte count up to WebGPU's buffer copy alignment
#[inline]
pub fn align_copy_size(unpadded: u64) -> u64 {
    let a = wgpu::COPY_BUFFER_ALIGNMENT;
    unpadded.div_ceil(a) * a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_sizes_round_to_four_bytes() {
        assert_eq!(align_copy_size(0), 0);
        assert_eq!(align_copy_size(1), 4);
        assert_eq!(align_copy_size(8), 8);
        assert_eq!(align_copy_size(13), 16);
    }
}
