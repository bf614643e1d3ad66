// src/path_tracing/wavefront/queues.rs
// Queue counters and active-index buffers for wavefront path tracing
// Counters are written by kernels and only trusted on the host after a read back and synchronize

use bytemuck::{Pod, Zeroable};

use super::state::IntegratorStateArena;
use crate::device::{
    synchronize_or_fail, DeviceKernel, DevicePtr, DeviceQueue, DeviceVector, NUM_INTEGRATOR_KERNELS,
};
use crate::error::RenderResult;

/// Per-kernel queue populations, as laid out in device memory
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IntegratorQueueCounter {
    pub num_queued: [u32; NUM_INTEGRATOR_KERNELS],
}

impl IntegratorQueueCounter {
    pub fn get(&self, kernel: DeviceKernel) -> usize {
        kernel
            .integrator_index()
            .map(|index| self.num_queued[index] as usize)
            .unwrap_or(0)
    }

    /// Sum over every queue. A slot holding both a main path and a pending shadow
    /// ray is counted once in each.
    pub fn num_active_paths(&self) -> usize {
        self.num_queued.iter().map(|count| *count as usize).sum()
    }

    /// Slots queued for a main path kernel
    pub fn num_main_paths(&self) -> usize {
        DeviceKernel::INTEGRATOR
            .iter()
            .filter(|kernel| !kernel.is_shadow())
            .map(|kernel| self.get(*kernel))
            .sum()
    }

    /// Slots holding a pending shadow ray
    pub fn num_shadow_paths(&self) -> usize {
        DeviceKernel::INTEGRATOR
            .iter()
            .filter(|kernel| kernel.is_shadow())
            .map(|kernel| self.get(*kernel))
            .sum()
    }

    /// Kernel with the largest queue, first in enumeration order on ties
    pub fn most_queued_kernel(&self) -> Option<DeviceKernel> {
        let mut best: Option<(DeviceKernel, u32)> = None;
        for kernel in DeviceKernel::INTEGRATOR {
            let count = self.num_queued[kernel as usize];
            if count > best.map_or(0, |(_, best_count)| best_count) {
                best = Some((kernel, count));
            }
        }
        best.map(|(kernel, _)| kernel)
    }
}

/// Device-resident queue counters plus per-shader sort counters
pub struct QueueCounterTable {
    counter: DeviceVector<IntegratorQueueCounter>,
    sort_key_counters: Vec<(DeviceKernel, DeviceVector<u32>)>,
    sort_prefix_sum: DeviceVector<u32>,
    max_shaders: usize,
}

impl Default for QueueCounterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueCounterTable {
    pub fn new() -> Self {
        let sort_key_counters = DeviceKernel::INTEGRATOR
            .iter()
            .filter(|kernel| kernel.uses_shader_sorting())
            .map(|kernel| (*kernel, DeviceVector::new("integrator_shader_sort_counter")))
            .collect();
        Self {
            counter: DeviceVector::new("integrator_queue_counter"),
            sort_key_counters,
            sort_prefix_sum: DeviceVector::new("integrator_shader_sort_prefix_sum"),
            max_shaders: 0,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.counter.is_allocated()
    }

    pub fn max_shaders(&self) -> usize {
        self.max_shaders
    }

    /// Allocate the counter table and `max_shaders` sort buckets per sorted kernel
    pub fn alloc(&mut self, queue: &mut dyn DeviceQueue, max_shaders: usize) -> RenderResult<()> {
        let max_shaders = max_shaders.max(1);
        self.counter.alloc(queue, 1)?;
        self.counter.zero_both(queue)?;
        for (_, counter) in &mut self.sort_key_counters {
            counter.alloc(queue, max_shaders)?;
            counter.zero_both(queue)?;
        }
        self.sort_prefix_sum.alloc(queue, max_shaders)?;
        self.sort_prefix_sum.zero_both(queue)?;
        self.max_shaders = max_shaders;
        Ok(())
    }

    /// Record the counter pointers in the state descriptor kernels read.
    /// Without `sort_keys`, shading kernels see no sort counters and skip bucketing.
    pub fn link(&self, arena: &mut IntegratorStateArena, sort_keys: bool) {
        arena.link_queue_counter(self.counter.device_pointer());
        if !sort_keys {
            return;
        }
        for (kernel, counter) in &self.sort_key_counters {
            arena.link_sort_key_counter(*kernel, counter.device_pointer());
        }
    }

    /// Zero every queue count on the device and in the host mirror
    pub fn reset(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.counter.zero_both(queue)
    }

    pub fn reset_sort_counters(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        for (_, counter) in &mut self.sort_key_counters {
            counter.zero_both(queue)?;
        }
        Ok(())
    }

    /// Copy the device counts to the host and wait for them
    pub fn read_back(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.counter.copy_from_device(queue)?;
        synchronize_or_fail(queue, "queue counter read back")
    }

    /// Host copy of the counts as of the last read back or reset
    pub fn counts(&self) -> IntegratorQueueCounter {
        self.counter.data().first().copied().unwrap_or_default()
    }

    pub fn num_queued(&self, kernel: DeviceKernel) -> usize {
        self.counts().get(kernel)
    }

    pub fn counter_ptr(&self) -> DevicePtr {
        self.counter.device_pointer()
    }

    pub fn sort_key_counter_ptr(&self, kernel: DeviceKernel) -> DevicePtr {
        self.sort_key_counters
            .iter()
            .find(|(sorted, _)| *sorted == kernel)
            .map(|(_, counter)| counter.device_pointer())
            .unwrap_or(DevicePtr::NULL)
    }

    pub fn sort_prefix_sum_ptr(&self) -> DevicePtr {
        self.sort_prefix_sum.device_pointer()
    }

    /// Zero one kernel's sort buckets on the device
    pub fn zero_sort_key_counter(
        &self,
        queue: &mut dyn DeviceQueue,
        kernel: DeviceKernel,
    ) -> RenderResult<()> {
        match self
            .sort_key_counters
            .iter()
            .find(|(sorted, _)| *sorted == kernel)
        {
            Some((_, counter)) => counter.zero_to_device(queue),
            None => Ok(()),
        }
    }
}

/// Scratch index list shared by every active-list, sort and compaction kernel
pub struct PathIndexArrays {
    pub queued_paths: DeviceVector<i32>,
    pub num_queued_paths: DeviceVector<u32>,
    /// Holes found by the terminated paths kernel during compaction
    pub num_terminated_paths: DeviceVector<u32>,
}

impl Default for PathIndexArrays {
    fn default() -> Self {
        Self::new()
    }
}

impl PathIndexArrays {
    pub fn new() -> Self {
        Self {
            queued_paths: DeviceVector::new("queued_paths"),
            num_queued_paths: DeviceVector::new("num_queued_paths"),
            num_terminated_paths: DeviceVector::new("num_terminated_paths"),
        }
    }

    pub fn alloc(&mut self, queue: &mut dyn DeviceQueue, capacity: usize) -> RenderResult<()> {
        self.queued_paths.alloc(queue, capacity)?;
        self.num_queued_paths.alloc(queue, 1)?;
        self.num_queued_paths.zero_both(queue)?;
        self.num_terminated_paths.alloc(queue, 1)?;
        self.num_terminated_paths.zero_both(queue)
    }

    pub fn indices_ptr(&self) -> DevicePtr {
        self.queued_paths.device_pointer()
    }

    pub fn count_ptr(&self) -> DevicePtr {
        self.num_queued_paths.device_pointer()
    }

    pub fn terminated_count_ptr(&self) -> DevicePtr {
        self.num_terminated_paths.device_pointer()
    }

    /// Zero both list counters on the device
    pub fn zero_counts(&self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.num_queued_paths.zero_to_device(queue)?;
        self.num_terminated_paths.zero_to_device(queue)
    }

    /// Read back (queued, terminated) list lengths. Blocks.
    pub fn read_counts(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<(usize, usize)> {
        self.num_queued_paths.copy_from_device(queue)?;
        self.num_terminated_paths.copy_from_device(queue)?;
        synchronize_or_fail(queue, "path index count read back")?;
        let first = |vector: &DeviceVector<u32>| vector.data().first().copied().unwrap_or(0) as usize;
        Ok((first(&self.num_queued_paths), first(&self.num_terminated_paths)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_with(entries: &[(DeviceKernel, u32)]) -> IntegratorQueueCounter {
        let mut counter = IntegratorQueueCounter::default();
        for (kernel, count) in entries {
            counter.num_queued[*kernel as usize] = *count;
        }
        counter
    }

    #[test]
    fn most_queued_breaks_ties_in_enumeration_order() {
        let counter = counter_with(&[
            (DeviceKernel::IntegratorShadeSurface, 5),
            (DeviceKernel::IntegratorIntersectClosest, 5),
            (DeviceKernel::IntegratorShadeBackground, 2),
        ]);
        assert_eq!(
            counter.most_queued_kernel(),
            Some(DeviceKernel::IntegratorIntersectClosest)
        );
        assert_eq!(IntegratorQueueCounter::default().most_queued_kernel(), None);
    }

    #[test]
    fn active_paths_count_shadow_rays_separately() {
        let counter = counter_with(&[
            (DeviceKernel::IntegratorIntersectClosest, 4),
            (DeviceKernel::IntegratorIntersectShadow, 3),
        ]);
        assert_eq!(counter.num_active_paths(), 7);
        assert_eq!(counter.num_main_paths(), 4);
        assert_eq!(counter.num_shadow_paths(), 3);
    }
}
