// src/device/wgpu_backend/mod.rs
// wgpu compute implementation of DeviceQueue
// Allocations are word ranges of one storage heap; each launch gets its own parameter block

pub mod pipeline;

pub use pipeline::KernelPipelines;

use std::sync::Arc;

use futures_intrusive::channel::shared::oneshot_channel;
use wgpu::util::DeviceExt;

use super::{DeviceKernel, DevicePtr, DeviceQueue, KernelArg, KernelArgs};
use crate::error::{RenderError, RenderResult};
use crate::gpu::{align_copy_size, try_ctx};
use crate::path_tracing::film::FILM_CONSTANT;
use crate::path_tracing::wavefront::state::{
    IntegratorStateGpu, NUM_STATE_FIELDS, StateField, INTEGRATOR_STATE_CONSTANT,
};

pub const WORKGROUP_SIZE: u32 = 64;
/// Workgroup count limit per dispatch dimension
const MAX_GROUPS_PER_DIM: u32 = 65535;
/// Shader-side encoding of the null pointer
const NULL_WORD: u32 = u32::MAX;

// Parameter block layout, mirrored by wavefront_common.wgsl
const PARAM_WORK_SIZE: usize = 0;
const PARAM_ARGS: usize = 1;
const MAX_KERNEL_ARGS: usize = 15;
const STATE_CAPACITY: usize = 16;
const STATE_QUEUE_COUNTER: usize = 17;
const STATE_NUM_FIELDS: usize = 18;
const STATE_FIELD_PTRS: usize = 19;
const MAX_STATE_FIELDS: usize = 24;
const STATE_FIELD_WORDS: usize = STATE_FIELD_PTRS + MAX_STATE_FIELDS;
const PARAM_WORDS: usize = STATE_FIELD_WORDS + MAX_STATE_FIELDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WgpuQueueConfig {
    /// Size of the device heap every allocation is carved from
    pub heap_bytes: u64,
    pub max_concurrent_states: usize,
    /// Defaults to a quarter of the concurrent states
    pub busy_states: Option<usize>,
}

impl Default for WgpuQueueConfig {
    fn default() -> Self {
        Self {
            heap_bytes: 64 << 20,
            max_concurrent_states: 1 << 16,
            busy_states: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Allocation {
    label: String,
    offset_words: u32,
    size: usize,
}

impl Allocation {
    fn padded_bytes(&self) -> u64 {
        align_copy_size(self.size as u64)
    }

    fn byte_offset(&self) -> u64 {
        u64::from(self.offset_words) * 4
    }
}

pub struct WgpuQueue {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    config: WgpuQueueConfig,
    heap: wgpu::Buffer,
    heap_top_words: u32,
    allocations: Vec<Allocation>,
    pipelines: KernelPipelines,
    /// Translated state descriptor words, from STATE_CAPACITY to the end of the block
    state_block: Option<[u32; PARAM_WORDS - STATE_CAPACITY]>,
    pending: Option<wgpu::CommandEncoder>,
    failed: bool,
}

impl WgpuQueue {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: WgpuQueueConfig,
    ) -> RenderResult<Self> {
        let max_binding = u64::from(device.limits().max_storage_buffer_binding_size);
        if config.heap_bytes == 0 || config.heap_bytes > max_binding {
            return Err(RenderError::config(format!(
                "heap of {} bytes does not fit a storage binding (limit {max_binding})",
                config.heap_bytes
            )));
        }
        let pipelines = KernelPipelines::new(&device)?;
        let heap = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("wavefront-device-heap"),
            size: align_copy_size(config.heap_bytes),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        // Catches asynchronous validation failures between synchronize points
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        log::info!(
            "wgpu queue: {} MiB heap, {} concurrent states",
            config.heap_bytes >> 20,
            config.max_concurrent_states
        );
        Ok(Self {
            device,
            queue,
            config,
            heap,
            heap_top_words: 0,
            allocations: Vec::new(),
            pipelines,
            state_block: None,
            pending: None,
            failed: false,
        })
    }

    /// Queue on the shared process-wide GPU context
    pub fn from_context(config: WgpuQueueConfig) -> RenderResult<Self> {
        let ctx = try_ctx()?;
        Self::new(ctx.device.clone(), ctx.queue.clone(), config)
    }

    /// Compile kernels provided by a collaborator, such as shading or intersection.
    /// `source` is appended to the shared bindings prelude.
    pub fn register_kernels(
        &mut self,
        label: &str,
        source: &str,
        kernels: &[DeviceKernel],
    ) -> RenderResult<()> {
        self.pipelines.compile(&self.device, label, source, kernels)
    }

    pub fn has_kernel(&self, kernel: DeviceKernel) -> bool {
        self.pipelines.contains(kernel)
    }

    pub fn heap_used_bytes(&self) -> u64 {
        u64::from(self.heap_top_words) * 4
    }

    fn allocation(&self, ptr: DevicePtr) -> RenderResult<&Allocation> {
        if ptr.is_null() {
            return Err(RenderError::render("null device pointer"));
        }
        self.allocations
            .get(ptr.0 as usize - 1)
            .ok_or_else(|| RenderError::render(format!("unknown device pointer {}", ptr.0)))
    }

    /// Heap word offset of a pointer, as shaders address it
    fn heap_word(&self, ptr: DevicePtr) -> u32 {
        if ptr.is_null() {
            return NULL_WORD;
        }
        self.allocations
            .get(ptr.0 as usize - 1)
            .map(|allocation| allocation.offset_words)
            .unwrap_or(NULL_WORD)
    }

    fn flush(&mut self) {
        if let Some(encoder) = self.pending.take() {
            self.queue.submit(Some(encoder.finish()));
        }
    }

    fn translate_state(&self, state: &IntegratorStateGpu) -> [u32; PARAM_WORDS - STATE_CAPACITY] {
        let mut block = [0u32; PARAM_WORDS - STATE_CAPACITY];
        let at = |index: usize| index - STATE_CAPACITY;
        block[at(STATE_CAPACITY)] = state.capacity;
        block[at(STATE_QUEUE_COUNTER)] = self.heap_word(state.queue_counter);
        block[at(STATE_NUM_FIELDS)] = NUM_STATE_FIELDS as u32;
        for field in StateField::ALL {
            block[at(STATE_FIELD_PTRS) + field.index()] = self.heap_word(state.field(field));
            block[at(STATE_FIELD_WORDS) + field.index()] = field.words() as u32;
        }
        block
    }

    fn param_block(&self, work_size: u32, args: &KernelArgs) -> RenderResult<Vec<u32>> {
        if args.len() > MAX_KERNEL_ARGS {
            return Err(RenderError::render(format!(
                "{} kernel arguments exceed the parameter block",
                args.len()
            )));
        }
        for arg in args.iter() {
            if let KernelArg::Ptr(ptr) = arg {
                if !ptr.is_null() {
                    self.allocation(*ptr)?;
                }
            }
        }
        let mut words = vec![0u32; PARAM_WORDS];
        words[PARAM_WORK_SIZE] = work_size;
        let arg_words = args.param_words(|ptr| self.heap_word(ptr));
        words[PARAM_ARGS..PARAM_ARGS + arg_words.len()].copy_from_slice(&arg_words);
        if let Some(block) = &self.state_block {
            words[STATE_CAPACITY..].copy_from_slice(block);
        }
        Ok(words)
    }
}

fn pending_encoder<'a>(
    device: &wgpu::Device,
    pending: &'a mut Option<wgpu::CommandEncoder>,
) -> &'a mut wgpu::CommandEncoder {
    pending.get_or_insert_with(|| {
        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("wavefront-queue-encoder"),
        })
    })
}

/// Workgroup grid covering `work_size` threads, wrapping into y past the per-dimension limit
pub fn dispatch_grid(work_size: u32) -> (u32, u32) {
    let groups = work_size.div_ceil(WORKGROUP_SIZE);
    if groups <= MAX_GROUPS_PER_DIM {
        (groups, 1)
    } else {
        (MAX_GROUPS_PER_DIM, groups.div_ceil(MAX_GROUPS_PER_DIM))
    }
}

impl DeviceQueue for WgpuQueue {
    fn init_execution(&mut self) -> RenderResult<()> {
        if self.failed {
            return Err(RenderError::device("wgpu queue is in a failed state"));
        }
        Ok(())
    }

    fn alloc(&mut self, label: &str, size: usize) -> RenderResult<DevicePtr> {
        let words = align_copy_size(size.max(1) as u64) / 4;
        let end = u64::from(self.heap_top_words) + words;
        if end * 4 > self.config.heap_bytes {
            return Err(RenderError::device(format!(
                "device heap exhausted allocating '{label}' ({size} bytes, {} of {} used)",
                self.heap_used_bytes(),
                self.config.heap_bytes
            )));
        }
        // The heap is never reused, so fresh ranges are still zero
        self.allocations.push(Allocation {
            label: label.to_string(),
            offset_words: self.heap_top_words,
            size,
        });
        self.heap_top_words = end as u32;
        log::debug!("alloc '{label}': {size} bytes");
        Ok(DevicePtr(self.allocations.len() as u32))
    }

    fn mem_size(&self, ptr: DevicePtr) -> RenderResult<usize> {
        Ok(self.allocation(ptr)?.size)
    }

    fn const_copy_to(&mut self, name: &str, data: &[u8]) -> RenderResult<()> {
        match name {
            INTEGRATOR_STATE_CONSTANT => {
                let state = IntegratorStateGpu::from_bytes(data)?;
                self.state_block = Some(self.translate_state(&state));
                Ok(())
            }
            // Film kernels receive the layout as launch arguments
            FILM_CONSTANT => Ok(()),
            other => Err(RenderError::upload(format!("unknown constant block '{other}'"))),
        }
    }

    fn enqueue(
        &mut self,
        kernel: DeviceKernel,
        work_size: usize,
        args: &KernelArgs,
    ) -> RenderResult<()> {
        if work_size == 0 {
            return Ok(());
        }
        let work_size = u32::try_from(work_size)
            .map_err(|_| RenderError::render(format!("work size {work_size} out of range")))?;
        let words = self.param_block(work_size, args)?;
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("wavefront-kernel-params"),
                contents: bytemuck::cast_slice(&words),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let pipeline = self.pipelines.get(kernel)?;
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("wavefront-kernel-bind-group"),
            layout: &self.pipelines.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.heap.as_entire_binding(),
                },
            ],
        });
        let (groups_x, groups_y) = dispatch_grid(work_size);
        let encoder = pending_encoder(&self.device, &mut self.pending);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        log::trace!("enqueue {kernel} x{work_size} ({groups_x}x{groups_y} groups)");
        Ok(())
    }

    fn zero_to_device(&mut self, ptr: DevicePtr) -> RenderResult<()> {
        let allocation = self.allocation(ptr)?;
        let (offset, size) = (allocation.byte_offset(), allocation.padded_bytes());
        pending_encoder(&self.device, &mut self.pending).clear_buffer(&self.heap, offset, Some(size));
        Ok(())
    }

    fn copy_to_device(&mut self, ptr: DevicePtr, data: &[u8]) -> RenderResult<()> {
        let allocation = self.allocation(ptr)?;
        if data.len() > allocation.size {
            return Err(RenderError::upload(format!(
                "{} bytes do not fit '{}' ({} bytes)",
                data.len(),
                allocation.label,
                allocation.size
            )));
        }
        let offset = allocation.byte_offset();
        // write_buffer lands before the next submission, so earlier launches go first
        self.flush();
        if data.len() % 4 == 0 {
            self.queue.write_buffer(&self.heap, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(align_copy_size(data.len() as u64) as usize, 0);
            self.queue.write_buffer(&self.heap, offset, &padded);
        }
        Ok(())
    }

    fn copy_from_device(&mut self, ptr: DevicePtr, data: &mut [u8]) -> RenderResult<()> {
        let allocation = self.allocation(ptr)?;
        if data.len() > allocation.size {
            return Err(RenderError::readback(format!(
                "cannot read {} bytes from '{}' ({} bytes)",
                data.len(),
                allocation.label,
                allocation.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        let offset = allocation.byte_offset();
        let size = align_copy_size(data.len() as u64);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("wavefront-readback-staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        pending_encoder(&self.device, &mut self.pending)
            .copy_buffer_to_buffer(&self.heap, offset, &staging, 0, size);
        self.flush();

        let slice = staging.slice(..);
        let (sender, receiver) = oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        self.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(receiver.receive())
            .ok_or_else(|| RenderError::readback("map_async channel closed"))?
            .map_err(|err| RenderError::readback(format!("map_async failed: {err:?}")))?;
        {
            let mapped = slice.get_mapped_range();
            data.copy_from_slice(&mapped[..data.len()]);
        }
        staging.unmap();
        Ok(())
    }

    fn synchronize(&mut self) -> bool {
        if self.failed {
            return false;
        }
        self.flush();
        self.device.poll(wgpu::Maintain::Wait);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            log::error!("wgpu device error: {err}");
            self.failed = true;
        }
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        !self.failed
    }

    fn num_concurrent_states(&self, state_size: usize) -> usize {
        // Half the heap for path states, the rest for work arrays and film
        let by_memory = (self.config.heap_bytes / 2) as usize / state_size.max(1);
        self.config.max_concurrent_states.min(by_memory)
    }

    fn num_concurrent_busy_states(&self) -> usize {
        self.config
            .busy_states
            .unwrap_or(self.config.max_concurrent_states / 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_launches_fit_one_row_of_groups() {
        assert_eq!(dispatch_grid(1), (1, 1));
        assert_eq!(dispatch_grid(64), (1, 1));
        assert_eq!(dispatch_grid(65), (2, 1));
    }

    #[test]
    fn large_launches_wrap_into_y() {
        let work = MAX_GROUPS_PER_DIM * WORKGROUP_SIZE + 1;
        let (x, y) = dispatch_grid(work);
        assert_eq!(x, MAX_GROUPS_PER_DIM);
        assert_eq!(y, 2);
        assert!(u64::from(x) * u64::from(y) * u64::from(WORKGROUP_SIZE) >= u64::from(work));
    }

    #[test]
    fn parameter_block_fits_the_state_schema() {
        assert!(NUM_STATE_FIELDS <= MAX_STATE_FIELDS);
        assert_eq!(STATE_CAPACITY, PARAM_ARGS + MAX_KERNEL_ARGS);
        assert_eq!(STATE_FIELD_WORDS, 43);
    }
}
