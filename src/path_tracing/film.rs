// src/path_tracing/film.rs
// Render buffer geometry and pass layout shared by shading, convergence and display kernels
// Buffers are float arrays of `pass_stride` values per pixel; the sample count pass stores u32 bits

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::device::{DevicePtr, DeviceQueue, DeviceVector, KernelArgs};
use crate::error::{RenderError, RenderResult};

/// Constant-memory block name of the film layout
pub const FILM_CONSTANT: &str = "kernel_film";

/// Offsets of the passes inside one pixel of the render buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct FilmLayout {
    /// RGBA radiance sum
    pub pass_combined: u32,
    /// RGBA sum over every other sample; alpha holds the converged flag
    pub pass_adaptive_aux: u32,
    /// Samples taken, as u32 bits
    pub pass_sample_count: u32,
    pub pass_stride: u32,
}

impl Default for FilmLayout {
    fn default() -> Self {
        Self {
            pass_combined: 0,
            pass_adaptive_aux: 4,
            pass_sample_count: 8,
            pass_stride: 9,
        }
    }
}

impl FilmLayout {
    /// Append the layout to a launch, in the order every film kernel reads it
    pub fn push_args(&self, args: KernelArgs) -> KernelArgs {
        args.int(self.pass_stride as i32)
            .int(self.pass_combined as i32)
            .int(self.pass_adaptive_aux as i32)
            .int(self.pass_sample_count as i32)
    }

    pub fn from_bytes(bytes: &[u8]) -> RenderResult<Self> {
        bytemuck::try_pod_read_unaligned(bytes)
            .map_err(|err| RenderError::upload(format!("malformed film layout: {err:?}")))
    }

    /// Read the layout back from `args` starting at `first`
    pub fn from_args(args: &KernelArgs, first: usize) -> RenderResult<Self> {
        Ok(Self {
            pass_stride: args.get_size(first)? as u32,
            pass_combined: args.get_size(first + 1)? as u32,
            pass_adaptive_aux: args.get_size(first + 2)? as u32,
            pass_sample_count: args.get_size(first + 3)? as u32,
        })
    }
}

/// Geometry of the render buffer within the full frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferParams {
    pub width: u32,
    pub height: u32,
    /// Position of the buffer in the full frame
    pub full_x: i32,
    pub full_y: i32,
    /// Pixel index of full-frame pixel (x, y) is `offset + x + y * stride`
    pub offset: i32,
    pub stride: i32,
    pub layout: FilmLayout,
}

impl BufferParams {
    pub fn new(width: u32, height: u32) -> Self {
        let mut params = Self {
            width,
            height,
            full_x: 0,
            full_y: 0,
            offset: 0,
            stride: width as i32,
            layout: FilmLayout::default(),
        };
        params.update_offset_stride();
        params
    }

    /// Place the buffer at (`full_x`, `full_y`) of the full frame
    pub fn with_full_offset(mut self, full_x: i32, full_y: i32) -> Self {
        self.full_x = full_x;
        self.full_y = full_y;
        self.update_offset_stride();
        self
    }

    pub fn update_offset_stride(&mut self) {
        self.stride = self.width as i32;
        self.offset = -(self.full_x + self.full_y * self.stride);
    }

    pub fn num_pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Floats needed for every pass of every pixel
    pub fn buffer_len(&self) -> usize {
        self.num_pixels() * self.layout.pass_stride as usize
    }

    /// Index of full-frame pixel (x, y) in the buffer
    pub fn pixel_index(&self, x: i32, y: i32) -> i64 {
        self.offset as i64 + x as i64 + y as i64 * self.stride as i64
    }

    pub fn validate(&self) -> RenderResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::config(format!(
                "render buffer must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        let layout = self.layout;
        let widest = layout
            .pass_combined
            .max(layout.pass_adaptive_aux + 3)
            .max(layout.pass_sample_count);
        if widest >= layout.pass_stride {
            return Err(RenderError::config(format!(
                "pass stride {} too small for film layout {:?}",
                layout.pass_stride, layout
            )));
        }
        Ok(())
    }
}

/// Device-resident render buffer with its geometry
pub struct RenderBuffers {
    pub params: BufferParams,
    pub buffer: DeviceVector<f32>,
}

impl RenderBuffers {
    pub fn new(params: BufferParams) -> Self {
        Self {
            params,
            buffer: DeviceVector::new("render_buffer"),
        }
    }

    /// Allocate and zero the buffer, and publish the pass layout to kernels
    pub fn alloc(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.params.validate()?;
        self.buffer.alloc(queue, self.params.buffer_len())?;
        self.buffer.zero_both(queue)?;
        queue.const_copy_to(FILM_CONSTANT, bytemuck::bytes_of(&self.params.layout))
    }

    pub fn device_pointer(&self) -> DevicePtr {
        self.buffer.device_pointer()
    }

    /// Copy the buffer to host memory. Blocks.
    pub fn copy_from_device(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.buffer.copy_from_device(queue)
    }

    /// Pass values of full-frame pixel (x, y) from the host copy
    pub fn pixel(&self, x: i32, y: i32) -> Option<&[f32]> {
        let index = usize::try_from(self.params.pixel_index(x, y)).ok()?;
        let stride = self.params.layout.pass_stride as usize;
        self.buffer.data().get(index * stride..(index + 1) * stride)
    }

    /// Samples recorded for full-frame pixel (x, y) in the host copy
    pub fn sample_count(&self, x: i32, y: i32) -> Option<u32> {
        let pixel = self.pixel(x, y)?;
        pixel
            .get(self.params.layout.pass_sample_count as usize)
            .map(|value| value.to_bits())
    }
}
