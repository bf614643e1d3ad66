// src/device/host.rs
// Host reference device: runs every scheduler kernel on the CPU over host memory
// Integrator kernels are delegated per path to a PathKernels implementation

use std::collections::HashMap;

use glam::Vec3;
use half::f16;

use super::{DeviceKernel, DevicePtr, DeviceQueue, KernelArgs, QUEUE_TAG_NONE};
use crate::error::{RenderError, RenderResult};
use crate::path_tracing::adaptive::{convergence_error, filter_converged_line};
use crate::path_tracing::film::{FilmLayout, FILM_CONSTANT};
use crate::path_tracing::tile_dispatch::KernelWorkTile;
use crate::path_tracing::wavefront::partition::{exclusive_prefix_sum, scatter_by_key};
use crate::path_tracing::wavefront::state::{
    IntegratorStateGpu, StateField, INTEGRATOR_STATE_CONSTANT,
};

/// Collaborator path tracing kernels, evaluated one path state at a time
pub trait PathKernels {
    /// Start the path for pixel (`x`, `y`) and `sample` of `tile` in `slot`
    fn init_path(
        &mut self,
        ctx: &mut HostIntegratorContext<'_>,
        kernel: DeviceKernel,
        tile: &KernelWorkTile,
        slot: usize,
        x: i32,
        y: i32,
        sample: u32,
    ) -> RenderResult<()>;

    /// Advance the path in `slot`, which is queued for `kernel`
    fn run_path(
        &mut self,
        ctx: &mut HostIntegratorContext<'_>,
        kernel: DeviceKernel,
        slot: usize,
    ) -> RenderResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDeviceConfig {
    pub max_concurrent_states: usize,
    /// Defaults to a quarter of the concurrent states
    pub busy_states: Option<usize>,
    pub graphics_interop: bool,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_states: 1 << 16,
            busy_states: None,
            graphics_interop: false,
        }
    }
}

struct HostAllocation {
    label: String,
    size: usize,
    words: Vec<u32>,
}

/// Word-addressed host memory behind device pointers
#[derive(Default)]
pub struct HostMemory {
    allocations: Vec<HostAllocation>,
}

impl HostMemory {
    fn alloc(&mut self, label: &str, size: usize) -> DevicePtr {
        self.allocations.push(HostAllocation {
            label: label.to_string(),
            size,
            words: vec![0; size.div_ceil(4).max(1)],
        });
        DevicePtr(self.allocations.len() as u32)
    }

    fn allocation(&self, ptr: DevicePtr) -> RenderResult<&HostAllocation> {
        (ptr.0 as usize)
            .checked_sub(1)
            .and_then(|index| self.allocations.get(index))
            .ok_or_else(|| RenderError::device(format!("invalid device pointer {ptr:?}")))
    }

    pub fn words(&self, ptr: DevicePtr) -> RenderResult<&[u32]> {
        Ok(&self.allocation(ptr)?.words)
    }

    pub fn words_mut(&mut self, ptr: DevicePtr) -> RenderResult<&mut [u32]> {
        (ptr.0 as usize)
            .checked_sub(1)
            .and_then(|index| self.allocations.get_mut(index))
            .map(|allocation| allocation.words.as_mut_slice())
            .ok_or_else(|| RenderError::device(format!("invalid device pointer {ptr:?}")))
    }

    fn word(&self, ptr: DevicePtr, index: usize) -> RenderResult<u32> {
        self.words(ptr)?.get(index).copied().ok_or_else(|| {
            RenderError::device(format!("read past end of {ptr:?} at word {index}"))
        })
    }

    fn set_word(&mut self, ptr: DevicePtr, index: usize, value: u32) -> RenderResult<()> {
        let slot = self.words_mut(ptr)?.get_mut(index).ok_or_else(|| {
            RenderError::device(format!("write past end of {ptr:?} at word {index}"))
        })?;
        *slot = value;
        Ok(())
    }

    fn add_word(&mut self, ptr: DevicePtr, index: usize, delta: i64) -> RenderResult<u32> {
        let old = self.word(ptr, index)?;
        let new = u32::try_from(old as i64 + delta).map_err(|_| {
            RenderError::render(format!(
                "counter {ptr:?}[{index}] out of range: {old} + {delta}"
            ))
        })?;
        self.set_word(ptr, index, new)?;
        Ok(old)
    }
}

/// View of device memory handed to [`PathKernels`]
pub struct HostIntegratorContext<'a> {
    memory: &'a mut HostMemory,
    state: &'a IntegratorStateGpu,
    film: FilmLayout,
    render_buffer: DevicePtr,
}

impl<'a> HostIntegratorContext<'a> {
    pub fn capacity(&self) -> usize {
        self.state.capacity as usize
    }

    fn check_slot(&self, slot: usize) -> RenderResult<()> {
        if slot < self.capacity() {
            Ok(())
        } else {
            Err(RenderError::render(format!(
                "state slot {slot} outside capacity {}",
                self.capacity()
            )))
        }
    }

    fn field_word(&self, field: StateField, slot: usize, component: usize) -> RenderResult<u32> {
        self.check_slot(slot)?;
        self.memory
            .word(self.state.field(field), slot * field.words() + component)
    }

    fn set_field_word(
        &mut self,
        field: StateField,
        slot: usize,
        component: usize,
        value: u32,
    ) -> RenderResult<()> {
        self.check_slot(slot)?;
        self.memory
            .set_word(self.state.field(field), slot * field.words() + component, value)
    }

    pub fn read(&self, field: StateField, slot: usize) -> RenderResult<u32> {
        self.field_word(field, slot, 0)
    }

    pub fn write(&mut self, field: StateField, slot: usize, value: u32) -> RenderResult<()> {
        self.set_field_word(field, slot, 0, value)
    }

    pub fn read_f32(&self, field: StateField, slot: usize) -> RenderResult<f32> {
        self.read(field, slot).map(f32::from_bits)
    }

    pub fn write_f32(&mut self, field: StateField, slot: usize, value: f32) -> RenderResult<()> {
        self.write(field, slot, value.to_bits())
    }

    pub fn read_vec3(&self, field: StateField, slot: usize) -> RenderResult<Vec3> {
        Ok(Vec3::new(
            f32::from_bits(self.field_word(field, slot, 0)?),
            f32::from_bits(self.field_word(field, slot, 1)?),
            f32::from_bits(self.field_word(field, slot, 2)?),
        ))
    }

    pub fn write_vec3(&mut self, field: StateField, slot: usize, value: Vec3) -> RenderResult<()> {
        for (component, value) in value.to_array().into_iter().enumerate() {
            self.set_field_word(field, slot, component, value.to_bits())?;
        }
        Ok(())
    }

    pub fn queued_kernel(&self, slot: usize) -> RenderResult<Option<DeviceKernel>> {
        Ok(DeviceKernel::from_queue_tag(
            self.read(StateField::PathQueuedKernel, slot)?,
        ))
    }

    pub fn shadow_queued_kernel(&self, slot: usize) -> RenderResult<Option<DeviceKernel>> {
        Ok(DeviceKernel::from_queue_tag(
            self.read(StateField::ShadowPathQueuedKernel, slot)?,
        ))
    }

    fn count(&mut self, kernel: DeviceKernel, delta: i64) -> RenderResult<()> {
        let index = kernel.integrator_index().ok_or_else(|| {
            RenderError::render(format!("{kernel} has no queue counter"))
        })?;
        self.memory
            .add_word(self.state.queue_counter, index, delta)
            .map(|_| ())
    }

    fn requeue(
        &mut self,
        field: StateField,
        slot: usize,
        current: Option<DeviceKernel>,
        next: Option<DeviceKernel>,
    ) -> RenderResult<()> {
        if let Some(current) = current {
            self.count(current, -1)?;
        }
        let tag = next.map_or(QUEUE_TAG_NONE, DeviceKernel::queue_tag);
        self.write(field, slot, tag)?;
        if let Some(next) = next {
            self.count(next, 1)?;
        }
        Ok(())
    }

    /// Queue a freshly initialised path for its first kernel
    pub fn path_init(&mut self, slot: usize, next: DeviceKernel) -> RenderResult<()> {
        self.requeue(StateField::PathQueuedKernel, slot, None, Some(next))
    }

    pub fn path_next(
        &mut self,
        slot: usize,
        current: DeviceKernel,
        next: DeviceKernel,
    ) -> RenderResult<()> {
        self.requeue(StateField::PathQueuedKernel, slot, Some(current), Some(next))
    }

    /// Queue for a sorted shading kernel, counting the slot in bucket `key`
    pub fn path_next_sorted(
        &mut self,
        slot: usize,
        current: Option<DeviceKernel>,
        next: DeviceKernel,
        key: u32,
    ) -> RenderResult<()> {
        self.requeue(StateField::PathQueuedKernel, slot, current, Some(next))?;
        self.write(StateField::PathShaderSortKey, slot, key)?;
        let counter = self.state.sort_key_counter(next);
        if !counter.is_null() {
            self.memory.add_word(counter, key as usize, 1)?;
        }
        Ok(())
    }

    pub fn path_terminate(&mut self, slot: usize, current: DeviceKernel) -> RenderResult<()> {
        self.requeue(StateField::PathQueuedKernel, slot, Some(current), None)
    }

    pub fn shadow_path_init(&mut self, slot: usize, next: DeviceKernel) -> RenderResult<()> {
        if self.shadow_queued_kernel(slot)?.is_some() {
            return Err(RenderError::render(format!(
                "slot {slot} already holds a pending shadow ray"
            )));
        }
        self.requeue(StateField::ShadowPathQueuedKernel, slot, None, Some(next))
    }

    pub fn shadow_path_next(
        &mut self,
        slot: usize,
        current: DeviceKernel,
        next: DeviceKernel,
    ) -> RenderResult<()> {
        self.requeue(
            StateField::ShadowPathQueuedKernel,
            slot,
            Some(current),
            Some(next),
        )
    }

    pub fn shadow_path_terminate(&mut self, slot: usize, current: DeviceKernel) -> RenderResult<()> {
        self.requeue(StateField::ShadowPathQueuedKernel, slot, Some(current), None)
    }

    /// Duplicate every field of `from` into `to`, without touching counters
    pub fn copy_state(&mut self, from: usize, to: usize) -> RenderResult<()> {
        copy_state(self.memory, self.state, from, to)
    }

    pub fn film(&self) -> FilmLayout {
        self.film
    }

    pub fn render_buffer(&self) -> DevicePtr {
        self.render_buffer
    }

    fn film_word(&self, pixel_index: i64, pass: u32) -> RenderResult<usize> {
        usize::try_from(pixel_index)
            .map(|index| index * self.film.pass_stride as usize + pass as usize)
            .map_err(|_| RenderError::render(format!("negative pixel index {pixel_index}")))
    }

    /// Add `values` to consecutive floats of pass `pass` of a pixel
    pub fn film_accumulate(&mut self, pixel_index: i64, pass: u32, values: &[f32]) -> RenderResult<()> {
        let base = self.film_word(pixel_index, pass)?;
        for (offset, value) in values.iter().enumerate() {
            let word = self.memory.word(self.render_buffer, base + offset)?;
            let sum = f32::from_bits(word) + value;
            self.memory
                .set_word(self.render_buffer, base + offset, sum.to_bits())?;
        }
        Ok(())
    }

    pub fn film_add_sample(&mut self, pixel_index: i64) -> RenderResult<()> {
        let word = self.film_word(pixel_index, self.film.pass_sample_count)?;
        self.memory.add_word(self.render_buffer, word, 1).map(|_| ())
    }
}

fn copy_state(
    memory: &mut HostMemory,
    state: &IntegratorStateGpu,
    from: usize,
    to: usize,
) -> RenderResult<()> {
    for field in StateField::ALL {
        let ptr = state.field(field);
        let words = field.words();
        for component in 0..words {
            let value = memory.word(ptr, from * words + component)?;
            memory.set_word(ptr, to * words + component, value)?;
        }
    }
    Ok(())
}

/// CPU implementation of the compute queue, for tests and reference renders
pub struct HostDevice<K: PathKernels> {
    config: HostDeviceConfig,
    memory: HostMemory,
    constants: HashMap<String, Vec<u8>>,
    constant_uploads: HashMap<String, usize>,
    state: Option<IntegratorStateGpu>,
    film: FilmLayout,
    kernels: K,
    launch_counts: HashMap<DeviceKernel, usize>,
    launch_log: Vec<(DeviceKernel, usize)>,
    synchronize_calls: usize,
    fail_synchronize_at: Option<usize>,
    failed: bool,
    execution_initialized: bool,
}

impl<K: PathKernels> HostDevice<K> {
    pub fn new(kernels: K, config: HostDeviceConfig) -> Self {
        Self {
            config,
            memory: HostMemory::default(),
            constants: HashMap::new(),
            constant_uploads: HashMap::new(),
            state: None,
            film: FilmLayout::default(),
            kernels,
            launch_counts: HashMap::new(),
            launch_log: Vec::new(),
            synchronize_calls: 0,
            fail_synchronize_at: None,
            failed: false,
            execution_initialized: false,
        }
    }

    pub fn kernels(&self) -> &K {
        &self.kernels
    }

    pub fn kernels_mut(&mut self) -> &mut K {
        &mut self.kernels
    }

    pub fn is_execution_initialized(&self) -> bool {
        self.execution_initialized
    }

    /// Make the `n`th synchronize from now report a device failure
    pub fn fail_synchronize_after(&mut self, n: usize) {
        self.fail_synchronize_at = Some(self.synchronize_calls + n.max(1));
    }

    pub fn launch_count(&self, kernel: DeviceKernel) -> usize {
        self.launch_counts.get(&kernel).copied().unwrap_or(0)
    }

    /// Every launch as (kernel, work size), in issue order
    pub fn launch_log(&self) -> &[(DeviceKernel, usize)] {
        &self.launch_log
    }

    pub fn clear_launch_log(&mut self) {
        self.launch_log.clear();
    }

    /// (label, size in bytes) of every allocation, in allocation order
    pub fn allocations(&self) -> Vec<(String, usize)> {
        self.memory
            .allocations
            .iter()
            .map(|allocation| (allocation.label.clone(), allocation.size))
            .collect()
    }

    pub fn constant(&self, name: &str) -> Option<&[u8]> {
        self.constants.get(name).map(Vec::as_slice)
    }

    /// How many times the constant block `name` was written
    pub fn constant_upload_count(&self, name: &str) -> usize {
        self.constant_uploads.get(name).copied().unwrap_or(0)
    }

    /// Device memory words of an allocation, bypassing the queue
    pub fn read_words(&self, ptr: DevicePtr) -> RenderResult<Vec<u32>> {
        self.memory.words(ptr).map(<[u32]>::to_vec)
    }

    /// Overwrite the leading words of an allocation, bypassing the queue
    pub fn write_words(&mut self, ptr: DevicePtr, data: &[u32]) -> RenderResult<()> {
        let words = self.memory.words_mut(ptr)?;
        if data.len() > words.len() {
            return Err(RenderError::upload(format!(
                "{} words do not fit allocation {ptr:?}",
                data.len()
            )));
        }
        words[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn state(&self) -> RenderResult<IntegratorStateGpu> {
        self.state.ok_or_else(|| {
            RenderError::render("integrator kernel launched before the state descriptor upload")
        })
    }

    fn context<'a>(
        memory: &'a mut HostMemory,
        state: &'a IntegratorStateGpu,
        film: FilmLayout,
        render_buffer: DevicePtr,
    ) -> HostIntegratorContext<'a> {
        HostIntegratorContext {
            memory,
            state,
            film,
            render_buffer,
        }
    }

    fn run_init(&mut self, kernel: DeviceKernel, work_size: usize, args: &KernelArgs) -> RenderResult<()> {
        let state = self.state()?;
        let tiles_ptr = args.get_ptr(0)?;
        let num_tiles = args.get_size(1)?;
        let render_buffer = args.get_ptr(2)?;
        let max_tile_work_size = args.get_size(3)?;
        if max_tile_work_size == 0 {
            return Ok(());
        }

        let bytes: &[u8] = bytemuck::cast_slice(self.memory.words(tiles_ptr)?);
        let tiles: Vec<KernelWorkTile> = bytes
            .chunks_exact(std::mem::size_of::<KernelWorkTile>())
            .take(num_tiles)
            .map(bytemuck::pod_read_unaligned::<KernelWorkTile>)
            .collect();
        let mut ctx = Self::context(&mut self.memory, &state, self.film, render_buffer);

        for thread in 0..work_size {
            let Some(tile) = tiles.get(thread / max_tile_work_size) else {
                break;
            };
            let local = thread % max_tile_work_size;
            if local >= tile.work_size as usize {
                continue;
            }
            let slot = tile.path_index_offset as usize + local;
            let (x, y, sample) = tile.work_pixel(local);
            self.kernels
                .init_path(&mut ctx, kernel, tile, slot, x, y, sample)?;
        }
        Ok(())
    }

    fn run_paths(&mut self, kernel: DeviceKernel, args: &KernelArgs) -> RenderResult<()> {
        let state = self.state()?;
        let path_index = args.get_ptr(0)?;
        let (render_buffer, work_size) = if kernel.is_shading() {
            (args.get_ptr(1)?, args.get_size(2)?)
        } else {
            (DevicePtr::NULL, args.get_size(1)?)
        };
        let slots: Vec<usize> = if path_index.is_null() {
            (0..work_size).collect()
        } else {
            self.memory
                .words(path_index)?
                .iter()
                .take(work_size)
                .map(|word| *word as i32)
                .filter(|slot| *slot >= 0)
                .map(|slot| slot as usize)
                .collect()
        };

        let tag_field = if kernel.is_shadow() {
            StateField::ShadowPathQueuedKernel
        } else {
            StateField::PathQueuedKernel
        };
        let mut ctx = Self::context(&mut self.memory, &state, self.film, render_buffer);
        for slot in slots {
            let tag = ctx.read(tag_field, slot)?;
            // Full-range launches skip slots queued elsewhere, index lists must match
            if tag != kernel.queue_tag() && path_index.is_null() {
                continue;
            }
            if tag != kernel.queue_tag() {
                return Err(RenderError::render(format!(
                    "slot {slot} dispatched to {kernel} but queued for {:?}",
                    DeviceKernel::from_queue_tag(tag)
                )));
            }
            self.kernels.run_path(&mut ctx, kernel, slot)?;
        }
        Ok(())
    }

    fn tags(&self, state: &IntegratorStateGpu, field: StateField, work_size: usize) -> RenderResult<Vec<u32>> {
        let words = self.memory.words(state.field(field))?;
        Ok(words[..work_size.min(words.len())].to_vec())
    }

    /// Append the selected slots to an index list behind an atomic length
    fn append_indices(
        &mut self,
        indices: DevicePtr,
        num_indices: DevicePtr,
        index_offset: usize,
        items: impl IntoIterator<Item = (usize, Option<usize>)>,
    ) -> RenderResult<()> {
        let mut offsets = [self.memory.word(num_indices, 0)?];
        let words = self.memory.words_mut(indices)?;
        let out: &mut [i32] = bytemuck::cast_slice_mut(words.get_mut(index_offset..).unwrap_or_default());
        scatter_by_key(items, &mut offsets, out);
        self.memory.set_word(num_indices, 0, offsets[0])
    }

    fn run_utility(&mut self, kernel: DeviceKernel, work_size: usize, args: &KernelArgs) -> RenderResult<()> {
        match kernel {
            DeviceKernel::IntegratorReset => {
                let state = self.state()?;
                let count = args.get_size(0)?.min(state.capacity as usize);
                for field in [StateField::PathQueuedKernel, StateField::ShadowPathQueuedKernel] {
                    let words = self.memory.words_mut(state.field(field))?;
                    words[..count].fill(QUEUE_TAG_NONE);
                }
                Ok(())
            }
            DeviceKernel::IntegratorQueuedPathsArray
            | DeviceKernel::IntegratorQueuedShadowPathsArray => {
                let state = self.state()?;
                let field = if kernel == DeviceKernel::IntegratorQueuedShadowPathsArray {
                    StateField::ShadowPathQueuedKernel
                } else {
                    StateField::PathQueuedKernel
                };
                let size = args.get_size(0)?;
                let tag = args.get_int(3)? as u32;
                let tags = self.tags(&state, field, size)?;
                let items = tags
                    .iter()
                    .enumerate()
                    .map(|(slot, t)| (slot, (*t == tag).then_some(0)));
                self.append_indices(args.get_ptr(1)?, args.get_ptr(2)?, 0, items)
            }
            DeviceKernel::IntegratorTerminatedPathsArray | DeviceKernel::IntegratorCompactPathsArray => {
                let state = self.state()?;
                let size = args.get_size(0)?;
                let path = self.tags(&state, StateField::PathQueuedKernel, size)?;
                let shadow = self.tags(&state, StateField::ShadowPathQueuedKernel, size)?;
                let param = args.get_size(3)?;
                let active = |slot: usize| {
                    path[slot] != QUEUE_TAG_NONE || shadow[slot] != QUEUE_TAG_NONE
                };
                let (offset, selected): (usize, Vec<(usize, Option<usize>)>) =
                    if kernel == DeviceKernel::IntegratorTerminatedPathsArray {
                        let holes = (0..path.len())
                            .map(|slot| (slot, (!active(slot)).then_some(0)))
                            .collect();
                        (param, holes)
                    } else {
                        let overflow = (0..path.len())
                            .map(|slot| (slot, (slot >= param && active(slot)).then_some(0)))
                            .collect();
                        (0, overflow)
                    };
                self.append_indices(args.get_ptr(1)?, args.get_ptr(2)?, offset, selected)
            }
            DeviceKernel::IntegratorCompactStates => {
                let state = self.state()?;
                let indices = args.get_ptr(0)?;
                let active_offset = args.get_size(1)?;
                let terminated_offset = args.get_size(2)?;
                let count = args.get_size(3)?;
                for i in 0..count {
                    let from = self.memory.word(indices, active_offset + i)? as usize;
                    let to = self.memory.word(indices, terminated_offset + i)? as usize;
                    copy_state(&mut self.memory, &state, from, to)?;
                    for field in [StateField::PathQueuedKernel, StateField::ShadowPathQueuedKernel] {
                        self.memory.set_word(state.field(field), from, QUEUE_TAG_NONE)?;
                    }
                }
                Ok(())
            }
            DeviceKernel::PrefixSum => {
                let counter = args.get_ptr(0)?;
                let prefix = args.get_ptr(1)?;
                let num_values = args.get_size(2)?;
                let out_of_range = || RenderError::render("prefix sum longer than its buffers");
                let mut values = self
                    .memory
                    .words(counter)?
                    .get(..num_values)
                    .ok_or_else(out_of_range)?
                    .to_vec();
                exclusive_prefix_sum(&mut values);
                self.memory
                    .words_mut(prefix)?
                    .get_mut(..num_values)
                    .ok_or_else(out_of_range)?
                    .copy_from_slice(&values);
                Ok(())
            }
            DeviceKernel::IntegratorSortedPathsArray => {
                let state = self.state()?;
                let size = args.get_size(0)?;
                let indices = args.get_ptr(1)?;
                let key_prefix = args.get_ptr(4)?;
                let tag = args.get_int(5)? as u32;
                let tags = self.tags(&state, StateField::PathQueuedKernel, size)?;
                let keys = self.tags(&state, StateField::PathShaderSortKey, size)?;
                let mut offsets = self.memory.words(key_prefix)?.to_vec();
                let items = (0..tags.len())
                    .map(|slot| (slot, (tags[slot] == tag).then_some(keys[slot] as usize)));
                let out: &mut [i32] = bytemuck::cast_slice_mut(self.memory.words_mut(indices)?);
                scatter_by_key(items, &mut offsets, out);
                self.memory.words_mut(key_prefix)?.copy_from_slice(&offsets);
                Ok(())
            }
            DeviceKernel::AdaptiveSamplingConvergenceCheck => {
                self.run_convergence_check(work_size, args)
            }
            DeviceKernel::AdaptiveSamplingFilterX | DeviceKernel::AdaptiveSamplingFilterY => {
                self.run_filter(kernel, args)
            }
            DeviceKernel::FilmConvertHalfRgba => self.run_film_convert(args),
            other => Err(RenderError::render(format!(
                "host device cannot run {other}"
            ))),
        }
    }

    fn pixel_base(film: &FilmLayout, offset: i32, stride: i32, x: i32, y: i32) -> RenderResult<usize> {
        let index = offset as i64 + x as i64 + y as i64 * stride as i64;
        usize::try_from(index)
            .map(|index| index * film.pass_stride as usize)
            .map_err(|_| RenderError::render(format!("pixel ({x}, {y}) outside the render buffer")))
    }

    fn run_convergence_check(&mut self, work_size: usize, args: &KernelArgs) -> RenderResult<()> {
        let buffer = args.get_ptr(0)?;
        let (full_x, full_y) = (args.get_int(1)?, args.get_int(2)?);
        let width = args.get_size(3)?;
        let threshold = args.get_float(5)?;
        let reset = args.get_int(6)? != 0;
        let (offset, stride) = (args.get_int(7)?, args.get_int(8)?);
        let num_active = args.get_ptr(9)?;
        let film = FilmLayout::from_args(args, 10)?;
        if width == 0 {
            return Ok(());
        }

        let mut unconverged = 0i64;
        for pixel in 0..work_size {
            let x = full_x + (pixel % width) as i32;
            let y = full_y + (pixel / width) as i32;
            let base = Self::pixel_base(&film, offset, stride, x, y)?;
            let words = self.memory.words_mut(buffer)?;
            let read4 = |words: &[u32], pass: u32| -> [f32; 4] {
                let start = base + pass as usize;
                [0, 1, 2, 3].map(|c| f32::from_bits(words[start + c]))
            };
            if base + film.pass_stride as usize > words.len() {
                return Err(RenderError::render("convergence check past end of render buffer"));
            }
            let aux_w = base + film.pass_adaptive_aux as usize + 3;
            if !reset && f32::from_bits(words[aux_w]) != 0.0 {
                continue;
            }
            let combined = read4(words, film.pass_combined);
            let aux = read4(words, film.pass_adaptive_aux);
            let samples = words[base + film.pass_sample_count as usize];
            let converged = convergence_error(combined, aux, samples) < threshold;
            words[aux_w] = if converged { 1.0f32 } else { 0.0f32 }.to_bits();
            if !converged {
                unconverged += 1;
            }
        }
        self.memory.add_word(num_active, 0, unconverged).map(|_| ())
    }

    fn run_filter(&mut self, kernel: DeviceKernel, args: &KernelArgs) -> RenderResult<()> {
        let buffer = args.get_ptr(0)?;
        let (full_x, full_y) = (args.get_int(1)?, args.get_int(2)?);
        let (width, height) = (args.get_size(3)?, args.get_size(4)?);
        let (offset, stride) = (args.get_int(5)?, args.get_int(6)?);
        let film = FilmLayout::from_args(args, 7)?;

        let lines: Vec<Vec<(i32, i32)>> = if kernel == DeviceKernel::AdaptiveSamplingFilterX {
            (0..height as i32)
                .map(|y| (0..width as i32).map(|x| (full_x + x, full_y + y)).collect())
                .collect()
        } else {
            (0..width as i32)
                .map(|x| (0..height as i32).map(|y| (full_x + x, full_y + y)).collect())
                .collect()
        };
        for line in lines {
            let words_at = line
                .iter()
                .map(|(x, y)| {
                    Self::pixel_base(&film, offset, stride, *x, *y)
                        .map(|base| base + film.pass_adaptive_aux as usize + 3)
                })
                .collect::<RenderResult<Vec<_>>>()?;
            let words = self.memory.words_mut(buffer)?;
            let mut flags = words_at
                .iter()
                .map(|w| words.get(*w).map(|bits| f32::from_bits(*bits)))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| RenderError::render("adaptive filter past end of render buffer"))?;
            filter_converged_line(&mut flags);
            for (w, flag) in words_at.iter().zip(flags) {
                words[*w] = flag.to_bits();
            }
        }
        Ok(())
    }

    fn run_film_convert(&mut self, args: &KernelArgs) -> RenderResult<()> {
        let buffer = args.get_ptr(0)?;
        let dst = args.get_ptr(1)?;
        let (full_x, full_y) = (args.get_int(2)?, args.get_int(3)?);
        let (width, height) = (args.get_size(4)?, args.get_size(5)?);
        let (offset, stride) = (args.get_int(6)?, args.get_int(7)?);
        let scale = args.get_float(8)?;
        let film = FilmLayout::from_args(args, 9)?;

        let mut packed = Vec::with_capacity(width * height * 2);
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                let base = Self::pixel_base(&film, offset, stride, full_x + x, full_y + y)?
                    + film.pass_combined as usize;
                let words = self.memory.words(buffer)?;
                let rgba = [0, 1, 2, 3].map(|c| {
                    let value = words.get(base + c).map_or(0.0, |bits| f32::from_bits(*bits));
                    f16::from_f32(value * scale).to_bits() as u32
                });
                packed.push(rgba[0] | (rgba[1] << 16));
                packed.push(rgba[2] | (rgba[3] << 16));
            }
        }
        let out = self.memory.words_mut(dst)?;
        if packed.len() > out.len() {
            return Err(RenderError::render("display buffer smaller than the film"));
        }
        out[..packed.len()].copy_from_slice(&packed);
        Ok(())
    }
}

impl<K: PathKernels> DeviceQueue for HostDevice<K> {
    fn init_execution(&mut self) -> RenderResult<()> {
        self.execution_initialized = true;
        Ok(())
    }

    fn alloc(&mut self, label: &str, size: usize) -> RenderResult<DevicePtr> {
        log::trace!("host alloc '{}' {} bytes", label, size);
        Ok(self.memory.alloc(label, size))
    }

    fn mem_size(&self, ptr: DevicePtr) -> RenderResult<usize> {
        Ok(self.memory.allocation(ptr)?.size)
    }

    fn const_copy_to(&mut self, name: &str, data: &[u8]) -> RenderResult<()> {
        match name {
            INTEGRATOR_STATE_CONSTANT => self.state = Some(IntegratorStateGpu::from_bytes(data)?),
            FILM_CONSTANT => self.film = FilmLayout::from_bytes(data)?,
            _ => {}
        }
        self.constants.insert(name.to_string(), data.to_vec());
        *self.constant_uploads.entry(name.to_string()).or_default() += 1;
        Ok(())
    }

    fn enqueue(
        &mut self,
        kernel: DeviceKernel,
        work_size: usize,
        args: &KernelArgs,
    ) -> RenderResult<()> {
        *self.launch_counts.entry(kernel).or_default() += 1;
        self.launch_log.push((kernel, work_size));
        log::trace!("host enqueue {} work_size={}", kernel, work_size);
        if work_size == 0 {
            return Ok(());
        }

        match kernel {
            DeviceKernel::IntegratorInitFromCamera | DeviceKernel::IntegratorInitFromBake => {
                self.run_init(kernel, work_size, args)
            }
            DeviceKernel::IntegratorMegakernel => Err(RenderError::render(
                "host device has no megakernel",
            )),
            kernel if kernel.integrator_index().is_some() => self.run_paths(kernel, args),
            kernel => self.run_utility(kernel, work_size, args),
        }
    }

    fn zero_to_device(&mut self, ptr: DevicePtr) -> RenderResult<()> {
        self.memory.words_mut(ptr)?.fill(0);
        Ok(())
    }

    fn copy_to_device(&mut self, ptr: DevicePtr, data: &[u8]) -> RenderResult<()> {
        let words = self.memory.words_mut(ptr)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(words);
        let dst = bytes.get_mut(..data.len()).ok_or_else(|| {
            RenderError::upload(format!("{} bytes do not fit allocation {ptr:?}", data.len()))
        })?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn copy_from_device(&mut self, ptr: DevicePtr, data: &mut [u8]) -> RenderResult<()> {
        let words = self.memory.words(ptr)?;
        let bytes: &[u8] = bytemuck::cast_slice(words);
        let src = bytes.get(..data.len()).ok_or_else(|| {
            RenderError::readback(format!("{} bytes exceed allocation {ptr:?}", data.len()))
        })?;
        data.copy_from_slice(src);
        Ok(())
    }

    fn synchronize(&mut self) -> bool {
        self.synchronize_calls += 1;
        if self.fail_synchronize_at == Some(self.synchronize_calls) {
            log::error!("host device: injected failure at synchronize #{}", self.synchronize_calls);
            self.failed = true;
        }
        !self.failed
    }

    fn num_concurrent_states(&self, _state_size: usize) -> usize {
        self.config.max_concurrent_states
    }

    fn num_concurrent_busy_states(&self) -> usize {
        self.config
            .busy_states
            .unwrap_or(self.config.max_concurrent_states / 4)
    }

    fn should_use_graphics_interop(&self) -> bool {
        self.config.graphics_interop
    }
}
