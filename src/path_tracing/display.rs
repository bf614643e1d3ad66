// src/path_tracing/display.rs
// Film to display conversion through graphics interop or a host round trip
// The strategy is chosen on first use and kept for the rest of the run

use half::f16;

use crate::device::{synchronize_or_fail, DeviceKernel, DevicePtr, DeviceQueue, DeviceVector, KernelArgs};
use crate::error::RenderResult;
use crate::path_tracing::config::DisplayUpdateMode;
use crate::path_tracing::film::RenderBuffers;

/// Surface presenting the converted film
pub trait GpuDisplay {
    /// Map the display's half float RGBA storage so kernels can write it directly.
    /// `None` means interop is unavailable for this display.
    fn map_device_buffer(
        &mut self,
        queue: &mut dyn DeviceQueue,
        width: u32,
        height: u32,
    ) -> RenderResult<Option<DevicePtr>>;

    fn unmap_device_buffer(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<()>;

    /// Upload host pixels, row-major, `width * height` entries
    fn copy_pixels_to_texture(
        &mut self,
        pixels: &[[f16; 4]],
        width: u32,
        height: u32,
    ) -> RenderResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStrategy {
    Interop,
    Naive,
}

/// Unpack two u32 words of packed half floats into one RGBA pixel
fn unpack_half_rgba(words: &[u32]) -> [f16; 4] {
    let lo = words.first().copied().unwrap_or(0);
    let hi = words.get(1).copied().unwrap_or(0);
    [
        f16::from_bits(lo as u16),
        f16::from_bits((lo >> 16) as u16),
        f16::from_bits(hi as u16),
        f16::from_bits((hi >> 16) as u16),
    ]
}

pub struct DisplayUpdater {
    strategy: Option<DisplayStrategy>,
    rgba_half: DeviceVector<u32>,
}

impl Default for DisplayUpdater {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayUpdater {
    pub fn new() -> Self {
        Self {
            strategy: None,
            rgba_half: DeviceVector::new("display_rgba_half"),
        }
    }

    /// Strategy in use, once the first update has decided it
    pub fn strategy(&self) -> Option<DisplayStrategy> {
        self.strategy
    }

    fn decide(&mut self, queue: &dyn DeviceQueue, mode: DisplayUpdateMode) -> DisplayStrategy {
        if let Some(strategy) = self.strategy {
            return strategy;
        }
        let strategy = match mode {
            DisplayUpdateMode::Auto if queue.should_use_graphics_interop() => DisplayStrategy::Interop,
            DisplayUpdateMode::Auto => DisplayStrategy::Naive,
            DisplayUpdateMode::Interop => DisplayStrategy::Interop,
            DisplayUpdateMode::Naive => DisplayStrategy::Naive,
        };
        log::info!("Display update strategy: {:?} (requested {})", strategy, mode);
        self.strategy = Some(strategy);
        strategy
    }

    fn enqueue_convert(
        queue: &mut dyn DeviceQueue,
        buffers: &RenderBuffers,
        dst: DevicePtr,
        scale: f32,
    ) -> RenderResult<()> {
        let params = &buffers.params;
        let args = params.layout.push_args(
            KernelArgs::new()
                .ptr(buffers.device_pointer())
                .ptr(dst)
                .int(params.full_x)
                .int(params.full_y)
                .int(params.width as i32)
                .int(params.height as i32)
                .int(params.offset)
                .int(params.stride)
                .float(scale),
        );
        queue.enqueue(DeviceKernel::FilmConvertHalfRgba, params.num_pixels(), &args)
    }

    /// Convert the combined pass scaled by `exposure / num_samples` and present it
    pub fn update(
        &mut self,
        queue: &mut dyn DeviceQueue,
        display: &mut dyn GpuDisplay,
        buffers: Option<&RenderBuffers>,
        mode: DisplayUpdateMode,
        exposure: f32,
        num_samples: u32,
    ) -> RenderResult<()> {
        let Some(buffers) = buffers.filter(|buffers| buffers.buffer.is_allocated()) else {
            log::warn!("Display update requested without render buffers");
            return Ok(());
        };
        let scale = exposure / num_samples.max(1) as f32;

        if self.decide(queue, mode) == DisplayStrategy::Interop {
            if self.update_interop(queue, display, buffers, scale)? {
                return Ok(());
            }
            log::warn!("Graphics interop unavailable, falling back to naive display update");
            self.strategy = Some(DisplayStrategy::Naive);
        }
        self.update_naive(queue, display, buffers, scale)
    }

    /// Returns false when the display could not be mapped
    fn update_interop(
        &mut self,
        queue: &mut dyn DeviceQueue,
        display: &mut dyn GpuDisplay,
        buffers: &RenderBuffers,
        scale: f32,
    ) -> RenderResult<bool> {
        let params = &buffers.params;
        let dst = match display.map_device_buffer(queue, params.width, params.height) {
            Ok(Some(dst)) if !dst.is_null() => dst,
            Ok(_) => return Ok(false),
            Err(err) => {
                log::warn!("Mapping display buffer failed: {}", err);
                return Ok(false);
            }
        };
        Self::enqueue_convert(queue, buffers, dst, scale)?;
        synchronize_or_fail(queue, "display conversion")?;
        display.unmap_device_buffer(queue)?;
        Ok(true)
    }

    fn update_naive(
        &mut self,
        queue: &mut dyn DeviceQueue,
        display: &mut dyn GpuDisplay,
        buffers: &RenderBuffers,
        scale: f32,
    ) -> RenderResult<()> {
        let params = &buffers.params;
        let words = params.num_pixels() * 2;
        if self.rgba_half.len() != words {
            self.rgba_half.alloc(queue, words)?;
        }
        Self::enqueue_convert(queue, buffers, self.rgba_half.device_pointer(), scale)?;
        self.rgba_half.copy_from_device(queue)?;
        synchronize_or_fail(queue, "display read back")?;

        let pixels: Vec<[f16; 4]> = self
            .rgba_half
            .data()
            .chunks_exact(2)
            .map(unpack_half_rgba)
            .collect();
        display.copy_pixels_to_texture(&pixels, params.width, params.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacks_low_half_first() {
        let r = f16::from_f32(0.5).to_bits() as u32;
        let g = f16::from_f32(1.0).to_bits() as u32;
        let b = f16::from_f32(2.0).to_bits() as u32;
        let pixel = unpack_half_rgba(&[r | (g << 16), b]);
        assert_eq!(pixel[0].to_f32(), 0.5);
        assert_eq!(pixel[1].to_f32(), 1.0);
        assert_eq!(pixel[2].to_f32(), 2.0);
        assert_eq!(pixel[3].to_f32(), 0.0);
    }
}
