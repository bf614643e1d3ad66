// src/path_tracing/wavefront/mod.rs
// Wavefront path tracing scheduler: admission, iteration and the render loop
// Queue-based GPU path tracing over a fixed arena of path states with stream compaction

pub mod dispatch;
pub mod lifecycle;
pub mod partition;
pub mod queues;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::device::{DeviceKernel, DeviceQueue, DeviceVector, KernelArgs};
use crate::error::{RenderError, RenderResult};
use crate::path_tracing::adaptive::ConvergenceSampler;
use crate::path_tracing::config::{IntegratorConfig, SceneInfo};
use crate::path_tracing::display::{DisplayStrategy, DisplayUpdater, GpuDisplay};
use crate::path_tracing::film::{BufferParams, RenderBuffers};
use crate::path_tracing::tile_dispatch::{KernelWorkTile, WorkTileScheduler};
use queues::{IntegratorQueueCounter, PathIndexArrays, QueueCounterTable};
use state::{integrator_state_size, IntegratorStateArena};

pub use dispatch::IterationKernel;
pub use lifecycle::AdmitOutcome;

/// What one `render_samples` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RenderStatistics {
    /// Mean occupied slots per iteration over the state capacity
    pub occupancy: f32,
    pub iterations: usize,
    pub tiles_admitted: usize,
    pub paths_admitted: usize,
    pub compactions: usize,
    pub cancelled: bool,
}

/// Wavefront integrator driving one compute queue
pub struct WavefrontIntegrator<Q: DeviceQueue> {
    queue: Q,
    config: IntegratorConfig,
    scene: SceneInfo,
    state: IntegratorStateArena,
    counters: QueueCounterTable,
    paths: PathIndexArrays,
    tile_scheduler: WorkTileScheduler,
    work_tiles: DeviceVector<KernelWorkTile>,
    buffers: Option<RenderBuffers>,
    /// All active slots lie below this index
    max_active_path_index: usize,
    cancel: Arc<AtomicBool>,
    display: DisplayUpdater,
    convergence: ConvergenceSampler,
    stats: RenderStatistics,
}

impl<Q: DeviceQueue> WavefrontIntegrator<Q> {
    pub fn new(queue: Q, config: IntegratorConfig, scene: SceneInfo) -> RenderResult<Self> {
        config.validate()?;
        Ok(Self {
            queue,
            config,
            scene,
            state: IntegratorStateArena::new(),
            counters: QueueCounterTable::new(),
            paths: PathIndexArrays::new(),
            tile_scheduler: WorkTileScheduler::new(),
            work_tiles: DeviceVector::new("work_tiles"),
            buffers: None,
            max_active_path_index: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            display: DisplayUpdater::new(),
            convergence: ConvergenceSampler::new(),
            stats: RenderStatistics::default(),
        })
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    pub fn into_queue(self) -> Q {
        self.queue
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    pub fn scene(&self) -> &SceneInfo {
        &self.scene
    }

    pub fn state(&self) -> &IntegratorStateArena {
        &self.state
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity()
    }

    pub fn max_active_path_index(&self) -> usize {
        self.max_active_path_index
    }

    pub fn paths(&self) -> &PathIndexArrays {
        &self.paths
    }

    pub fn counters(&self) -> &QueueCounterTable {
        &self.counters
    }

    /// Host copy of the queue counts as of the last read back
    pub fn queue_counter(&self) -> IntegratorQueueCounter {
        self.counters.counts()
    }

    pub fn read_queue_counters(&mut self) -> RenderResult<IntegratorQueueCounter> {
        self.counters.read_back(&mut self.queue)?;
        Ok(self.counters.counts())
    }

    /// Flag polled at the top of every scheduling step
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn render_buffers(&self) -> Option<&RenderBuffers> {
        self.buffers.as_ref()
    }

    pub fn render_buffers_mut(&mut self) -> Option<&mut RenderBuffers> {
        self.buffers.as_mut()
    }

    /// Copy the render buffer to the host. Blocks.
    pub fn read_render_buffers(&mut self) -> RenderResult<&RenderBuffers> {
        let buffers = self
            .buffers
            .as_mut()
            .ok_or_else(|| RenderError::readback("no render buffers to read back"))?;
        buffers.copy_from_device(&mut self.queue)?;
        crate::device::synchronize_or_fail(&mut self.queue, "render buffer read back")?;
        Ok(buffers)
    }

    pub fn display_strategy(&self) -> Option<DisplayStrategy> {
        self.display.strategy()
    }

    /// Allocate path states, counters and index lists, and upload the state
    /// descriptor. Later calls are no-ops.
    pub fn init_execution(&mut self) -> RenderResult<()> {
        if self.state.is_allocated() {
            return Ok(());
        }
        self.queue.init_execution()?;

        let device_states = self.queue.num_concurrent_states(integrator_state_size());
        let capacity = match self.config.max_num_paths {
            Some(limit) => device_states.min(limit),
            None => device_states,
        };
        if self.scene.has_shadow_catcher && capacity < 2 {
            return Err(RenderError::config(format!(
                "shadow catcher needs at least 2 path states, got {capacity}"
            )));
        }
        self.state.alloc(&mut self.queue, capacity)?;
        self.counters.alloc(&mut self.queue, self.scene.max_shaders)?;
        self.counters
            .link(&mut self.state, self.config.use_shader_sorting);
        self.paths.alloc(&mut self.queue, capacity)?;
        self.state.upload_descriptor(&mut self.queue)?;

        log::info!(
            "Wavefront integrator: {} path states, {} busy threshold, {} shaders, shadow catcher {}",
            capacity,
            self.queue.num_concurrent_busy_states(),
            self.counters.max_shaders(),
            self.scene.has_shadow_catcher
        );
        Ok(())
    }

    /// Allocate a zeroed render buffer for `params`, replacing any previous one
    pub fn set_buffers(&mut self, params: BufferParams) -> RenderResult<()> {
        let mut buffers = RenderBuffers::new(params);
        buffers.alloc(&mut self.queue)?;
        self.buffers = Some(buffers);
        Ok(())
    }

    /// Clear every path state tag and queue counter on the device
    pub fn enqueue_reset(&mut self) -> RenderResult<()> {
        let capacity = self.state.capacity();
        self.queue.enqueue(
            DeviceKernel::IntegratorReset,
            capacity,
            &KernelArgs::new().size(capacity),
        )?;
        self.counters.reset(&mut self.queue)?;
        self.counters.reset_sort_counters(&mut self.queue)?;
        self.max_active_path_index = 0;
        Ok(())
    }

    /// Prepare a pass over `samples_num` samples from `start_sample` without running it
    pub fn reset_pass(&mut self, start_sample: u32, samples_num: u32) -> RenderResult<()> {
        self.init_execution()?;
        let params = self
            .buffers
            .as_ref()
            .map(|buffers| buffers.params)
            .ok_or_else(|| RenderError::render("render pass started before set_buffers"))?;

        let budget = (self.state.capacity() / self.config.tile_state_divisor).max(1);
        self.tile_scheduler.set_max_num_path_states(budget);
        self.tile_scheduler.reset(&params, start_sample, samples_num);
        self.enqueue_reset()?;
        self.stats = RenderStatistics::default();
        Ok(())
    }

    /// Render `samples_num` samples of every pixel, or until cancelled
    pub fn render_samples(
        &mut self,
        start_sample: u32,
        samples_num: u32,
    ) -> RenderResult<RenderStatistics> {
        self.reset_pass(start_sample, samples_num)?;
        let mut active_sum = 0usize;

        loop {
            let admit = self.enqueue_work_tiles()?;
            if admit.enqueued {
                self.counters.read_back(&mut self.queue)?;
            }
            if admit.finished {
                break;
            }

            // Main paths only, a pending shadow ray shares its slot
            let num_main = self.counters.counts().num_main_paths();
            let iterated = self.enqueue_path_iteration()?;
            if iterated {
                self.counters.read_back(&mut self.queue)?;
                self.stats.iterations += 1;
                active_sum += num_main;
            }

            if !admit.enqueued && !iterated {
                log::error!(
                    "Wavefront scheduler stalled with counts {:?}",
                    self.counters.counts()
                );
                return Err(RenderError::render(
                    "scheduler stalled: no tiles admitted and no kernel queued",
                ));
            }
        }

        if self.stats.iterations > 0 && self.state.capacity() > 0 {
            self.stats.occupancy = active_sum as f32
                / self.stats.iterations as f32
                / self.state.capacity() as f32;
        }
        self.stats.cancelled = self.is_cancelled();
        log::debug!("Render pass finished: {:?}", self.stats);
        Ok(self.stats)
    }

    /// Present the film, scaled for `num_samples` samples, on `display`
    pub fn copy_to_gpu_display(
        &mut self,
        display: &mut dyn GpuDisplay,
        num_samples: u32,
    ) -> RenderResult<()> {
        self.display.update(
            &mut self.queue,
            display,
            self.buffers.as_ref(),
            self.config.display_update,
            self.config.exposure,
            num_samples,
        )
    }

    /// Update the adaptive sampling mask and count the pixels still needing samples
    pub fn adaptive_sampling_converge_filter_count_active(
        &mut self,
        threshold: f32,
        reset: bool,
    ) -> RenderResult<usize> {
        let buffers = self
            .buffers
            .as_ref()
            .ok_or_else(|| RenderError::render("adaptive sampling requested before set_buffers"))?;
        self.convergence
            .converge_filter_count_active(&mut self.queue, buffers, threshold, reset)
    }
}
