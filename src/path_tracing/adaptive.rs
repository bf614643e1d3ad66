// src/path_tracing/adaptive.rs
// Adaptive sampling convergence check and mask filters over the render buffer
// Runs between sample batches; independent of path state slots

use crate::device::{synchronize_or_fail, DeviceKernel, DeviceQueue, DeviceVector, KernelArgs};
use crate::error::{RenderError, RenderResult};
use crate::path_tracing::film::RenderBuffers;

/// Per-pixel error of the full estimate `combined` against the half-sample
/// estimate `aux`, relative to the square root of the pixel intensity.
pub fn convergence_error(combined: [f32; 4], aux: [f32; 4], sample_count: u32) -> f32 {
    let scale = 1.0 / sample_count.max(1) as f32;
    let difference = ((combined[0] - aux[0]).abs()
        + (combined[1] - aux[1]).abs()
        + (combined[2] - aux[2]).abs())
        * scale;
    let intensity = (combined[0] + combined[1] + combined[2]) * scale;
    difference / (1e-4 + intensity.max(0.0).sqrt())
}

/// Grow unconverged runs by one pixel on each side along a line.
///
/// `flags` holds the converged flag of consecutive pixels; zero means the pixel
/// still needs samples.
pub fn filter_converged_line(flags: &mut [f32]) {
    let mut prev = false;
    for index in 0..flags.len() {
        if flags[index] == 0.0 {
            if index > 0 && !prev {
                flags[index - 1] = 0.0;
            }
            prev = true;
        } else {
            if prev {
                flags[index] = 0.0;
            }
            prev = false;
        }
    }
}

/// Drives the convergence kernels for one render buffer
pub struct ConvergenceSampler {
    num_active_pixels: DeviceVector<u32>,
}

impl Default for ConvergenceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvergenceSampler {
    pub fn new() -> Self {
        Self {
            num_active_pixels: DeviceVector::new("num_active_pixels"),
        }
    }

    /// Mark converged pixels, spread the unconverged mask and return how many
    /// pixels still need samples. Filters are skipped when none do.
    pub fn converge_filter_count_active(
        &mut self,
        queue: &mut dyn DeviceQueue,
        buffers: &RenderBuffers,
        threshold: f32,
        reset: bool,
    ) -> RenderResult<usize> {
        if !buffers.buffer.is_allocated() {
            return Err(RenderError::render(
                "adaptive sampling requested without allocated render buffers",
            ));
        }
        let num_active = self.convergence_check_count_active(queue, buffers, threshold, reset)?;
        if num_active > 0 {
            self.enqueue_filter(queue, buffers, DeviceKernel::AdaptiveSamplingFilterX)?;
            self.enqueue_filter(queue, buffers, DeviceKernel::AdaptiveSamplingFilterY)?;
            synchronize_or_fail(queue, "adaptive sampling filter")?;
        }
        log::debug!("Adaptive sampling: {} pixels active", num_active);
        Ok(num_active)
    }

    fn convergence_check_count_active(
        &mut self,
        queue: &mut dyn DeviceQueue,
        buffers: &RenderBuffers,
        threshold: f32,
        reset: bool,
    ) -> RenderResult<usize> {
        if !self.num_active_pixels.is_allocated() {
            self.num_active_pixels.alloc(queue, 1)?;
        }
        self.num_active_pixels.zero_to_device(queue)?;

        let params = &buffers.params;
        let args = params.layout.push_args(
            KernelArgs::new()
                .ptr(buffers.device_pointer())
                .int(params.full_x)
                .int(params.full_y)
                .int(params.width as i32)
                .int(params.height as i32)
                .float(threshold)
                .flag(reset)
                .int(params.offset)
                .int(params.stride)
                .ptr(self.num_active_pixels.device_pointer()),
        );
        queue.enqueue(
            DeviceKernel::AdaptiveSamplingConvergenceCheck,
            params.num_pixels(),
            &args,
        )?;

        self.num_active_pixels.copy_from_device(queue)?;
        synchronize_or_fail(queue, "adaptive sampling convergence check")?;
        Ok(self.num_active_pixels.data().first().copied().unwrap_or(0) as usize)
    }

    fn enqueue_filter(
        &self,
        queue: &mut dyn DeviceQueue,
        buffers: &RenderBuffers,
        kernel: DeviceKernel,
    ) -> RenderResult<()> {
        let params = &buffers.params;
        let work_size = match kernel {
            DeviceKernel::AdaptiveSamplingFilterX => params.height as usize,
            _ => params.width as usize,
        };
        let args = params.layout.push_args(
            KernelArgs::new()
                .ptr(buffers.device_pointer())
                .int(params.full_x)
                .int(params.full_y)
                .int(params.width as i32)
                .int(params.height as i32)
                .int(params.offset)
                .int(params.stride),
        );
        queue.enqueue(kernel, work_size, &args)
    }
}
