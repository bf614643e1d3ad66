// src/path_tracing/wavefront/dispatch.rs
// Per-iteration kernel choice and active index list construction

use std::fmt;

use super::WavefrontIntegrator;
use crate::device::{DeviceKernel, DevicePtr, DeviceQueue, KernelArgs};
use crate::error::{RenderError, RenderResult};

/// Integrator kernels the iteration loop can launch over queued paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterationKernel {
    IntersectClosest,
    IntersectShadow,
    IntersectSubsurface,
    IntersectVolumeStack,
    ShadeBackground,
    ShadeLight,
    ShadeShadow,
    ShadeSurface,
    ShadeSurfaceRaytrace,
    ShadeVolume,
}

impl IterationKernel {
    pub fn device_kernel(self) -> DeviceKernel {
        match self {
            IterationKernel::IntersectClosest => DeviceKernel::IntegratorIntersectClosest,
            IterationKernel::IntersectShadow => DeviceKernel::IntegratorIntersectShadow,
            IterationKernel::IntersectSubsurface => DeviceKernel::IntegratorIntersectSubsurface,
            IterationKernel::IntersectVolumeStack => DeviceKernel::IntegratorIntersectVolumeStack,
            IterationKernel::ShadeBackground => DeviceKernel::IntegratorShadeBackground,
            IterationKernel::ShadeLight => DeviceKernel::IntegratorShadeLight,
            IterationKernel::ShadeShadow => DeviceKernel::IntegratorShadeShadow,
            IterationKernel::ShadeSurface => DeviceKernel::IntegratorShadeSurface,
            IterationKernel::ShadeSurfaceRaytrace => DeviceKernel::IntegratorShadeSurfaceRaytrace,
            IterationKernel::ShadeVolume => DeviceKernel::IntegratorShadeVolume,
        }
    }

    /// Shading kernels also take the render buffer
    pub fn writes_film(self) -> bool {
        matches!(
            self,
            IterationKernel::ShadeBackground
                | IterationKernel::ShadeLight
                | IterationKernel::ShadeShadow
                | IterationKernel::ShadeSurface
                | IterationKernel::ShadeSurfaceRaytrace
                | IterationKernel::ShadeVolume
        )
    }

    fn reads_shadow_tag(self) -> bool {
        matches!(
            self,
            IterationKernel::IntersectShadow | IterationKernel::ShadeShadow
        )
    }
}

impl TryFrom<DeviceKernel> for IterationKernel {
    type Error = RenderError;

    fn try_from(kernel: DeviceKernel) -> Result<Self, Self::Error> {
        Ok(match kernel {
            DeviceKernel::IntegratorIntersectClosest => IterationKernel::IntersectClosest,
            DeviceKernel::IntegratorIntersectShadow => IterationKernel::IntersectShadow,
            DeviceKernel::IntegratorIntersectSubsurface => IterationKernel::IntersectSubsurface,
            DeviceKernel::IntegratorIntersectVolumeStack => IterationKernel::IntersectVolumeStack,
            DeviceKernel::IntegratorShadeBackground => IterationKernel::ShadeBackground,
            DeviceKernel::IntegratorShadeLight => IterationKernel::ShadeLight,
            DeviceKernel::IntegratorShadeShadow => IterationKernel::ShadeShadow,
            DeviceKernel::IntegratorShadeSurface => IterationKernel::ShadeSurface,
            DeviceKernel::IntegratorShadeSurfaceRaytrace => IterationKernel::ShadeSurfaceRaytrace,
            DeviceKernel::IntegratorShadeVolume => IterationKernel::ShadeVolume,
            other => {
                return Err(RenderError::render(format!(
                    "unhandled kernel {other} in path iteration"
                )))
            }
        })
    }
}

impl fmt::Display for IterationKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device_kernel())
    }
}

impl<Q: DeviceQueue> WavefrontIntegrator<Q> {
    /// Kernel with the most queued paths in the last read back counts
    pub fn get_most_queued_kernel(&self) -> Option<DeviceKernel> {
        self.counters.counts().most_queued_kernel()
    }

    /// Kernel the next iteration launches: the most queued one, unless it can
    /// queue shadow rays while shadow rays are still pending.
    pub fn next_iteration_kernel(&self) -> Option<DeviceKernel> {
        let counts = self.counters.counts();
        let kernel = counts.most_queued_kernel()?;
        if kernel.creates_shadow_paths() {
            for shadow in [
                DeviceKernel::IntegratorIntersectShadow,
                DeviceKernel::IntegratorShadeShadow,
            ] {
                if counts.get(shadow) > 0 {
                    return Some(shadow);
                }
            }
        }
        Some(kernel)
    }

    /// Launch one integrator kernel over its queued paths. Returns false when
    /// no path is queued anywhere.
    pub fn enqueue_path_iteration(&mut self) -> RenderResult<bool> {
        let Some(kernel) = self.next_iteration_kernel() else {
            return Ok(false);
        };
        let kernel = match IterationKernel::try_from(kernel) {
            Ok(kernel) => kernel,
            Err(err) => {
                log::error!("{}", err);
                return Err(err);
            }
        };
        let num_queued = self.counters.num_queued(kernel.device_kernel());
        self.enqueue_path_iteration_kernel(kernel, num_queued)?;
        Ok(true)
    }

    fn enqueue_path_iteration_kernel(
        &mut self,
        kernel: IterationKernel,
        num_queued: usize,
    ) -> RenderResult<()> {
        let device_kernel = kernel.device_kernel();
        let max_active_path_index = self.max_active_path_index;

        let (path_index, work_size) =
            if self.config.use_shader_sorting && device_kernel.uses_shader_sorting() {
                self.compute_sorted_queued_paths(device_kernel, num_queued)?;
                (self.paths.indices_ptr(), num_queued)
            } else if num_queued < max_active_path_index {
                self.compute_queued_paths(kernel)?;
                (self.paths.indices_ptr(), num_queued)
            } else {
                (DevicePtr::NULL, max_active_path_index)
            };

        log::trace!(
            "Iteration {}: {} queued, work size {}, {}",
            kernel,
            num_queued,
            work_size,
            if path_index.is_null() { "full range" } else { "index list" }
        );

        let args = if kernel.writes_film() {
            let render_buffer = self
                .buffers
                .as_ref()
                .map(|buffers| buffers.device_pointer())
                .unwrap_or(DevicePtr::NULL);
            KernelArgs::new()
                .ptr(path_index)
                .ptr(render_buffer)
                .size(work_size)
        } else {
            KernelArgs::new().ptr(path_index).size(work_size)
        };
        self.queue.enqueue(device_kernel, work_size, &args)
    }

    /// Build the index list of paths queued for `kernel`, grouped by shader
    fn compute_sorted_queued_paths(
        &mut self,
        kernel: DeviceKernel,
        num_queued: usize,
    ) -> RenderResult<()> {
        let key_counter = self.counters.sort_key_counter_ptr(kernel);
        let key_prefix = self.counters.sort_prefix_sum_ptr();
        let max_shaders = self.counters.max_shaders();

        // Bucket start offsets, consumed by the scatter below
        self.queue.enqueue(
            DeviceKernel::PrefixSum,
            1,
            &KernelArgs::new()
                .ptr(key_counter)
                .ptr(key_prefix)
                .size(max_shaders),
        )?;

        self.paths.num_queued_paths.zero_to_device(&mut self.queue)?;
        let max_active_path_index = self.max_active_path_index;
        let args = KernelArgs::new()
            .size(max_active_path_index)
            .ptr(self.paths.indices_ptr())
            .ptr(self.paths.count_ptr())
            .ptr(key_counter)
            .ptr(key_prefix)
            .int(kernel.queue_tag() as i32);
        self.queue.enqueue(
            DeviceKernel::IntegratorSortedPathsArray,
            max_active_path_index,
            &args,
        )?;

        // Shading may queue paths back into the same kernel
        self.counters.zero_sort_key_counter(&mut self.queue, kernel)?;
        log::trace!("Sorted {} paths for {} over {} shaders", num_queued, kernel, max_shaders);
        Ok(())
    }

    /// Build the unsorted index list of paths queued for `kernel`
    fn compute_queued_paths(&mut self, kernel: IterationKernel) -> RenderResult<()> {
        let array_kernel = if kernel.reads_shadow_tag() {
            DeviceKernel::IntegratorQueuedShadowPathsArray
        } else {
            DeviceKernel::IntegratorQueuedPathsArray
        };
        self.paths.num_queued_paths.zero_to_device(&mut self.queue)?;
        let max_active_path_index = self.max_active_path_index;
        let args = KernelArgs::new()
            .size(max_active_path_index)
            .ptr(self.paths.indices_ptr())
            .ptr(self.paths.count_ptr())
            .int(kernel.device_kernel().queue_tag() as i32);
        self.queue
            .enqueue(array_kernel, max_active_path_index, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::{HostDevice, HostDeviceConfig};
    use crate::device::synthetic::SyntheticKernels;
    use crate::path_tracing::config::{IntegratorConfig, SceneInfo};
    use crate::path_tracing::film::BufferParams;
    use crate::path_tracing::wavefront::state::StateField;

    #[test]
    fn only_path_kernels_convert() {
        for kernel in DeviceKernel::INTEGRATOR {
            let converted = IterationKernel::try_from(kernel);
            match kernel {
                DeviceKernel::IntegratorInitFromCamera
                | DeviceKernel::IntegratorInitFromBake
                | DeviceKernel::IntegratorMegakernel => assert!(converted.is_err()),
                _ => assert_eq!(converted.unwrap().device_kernel(), kernel),
            }
        }
        assert!(IterationKernel::try_from(DeviceKernel::PrefixSum).is_err());
    }

    #[test]
    fn film_writers_match_shading_kernels() {
        for kernel in DeviceKernel::INTEGRATOR {
            if let Ok(iteration) = IterationKernel::try_from(kernel) {
                assert_eq!(iteration.writes_film(), kernel.is_shading());
                assert_eq!(iteration.reads_shadow_tag(), kernel.is_shadow());
            }
        }
    }

    #[test]
    fn sorted_list_groups_paths_by_shader() {
        let device = HostDevice::new(
            SyntheticKernels::new(3, 4),
            HostDeviceConfig {
                max_concurrent_states: 8,
                ..HostDeviceConfig::default()
            },
        );
        let scene = SceneInfo {
            max_shaders: 3,
            ..SceneInfo::default()
        };
        let mut integrator =
            WavefrontIntegrator::new(device, IntegratorConfig::default(), scene).unwrap();
        integrator.set_buffers(BufferParams::new(4, 4)).unwrap();
        integrator.init_execution().unwrap();

        let kernel = DeviceKernel::IntegratorShadeSurface;
        let keys = [2u32, 0, 2, 1, 0];
        let tags = vec![kernel.queue_tag(); keys.len()];
        let mut counts = [0u32; crate::device::NUM_INTEGRATOR_KERNELS];
        counts[kernel.integrator_index().unwrap()] = keys.len() as u32;

        let tag_ptr = integrator.state.field_ptr(StateField::PathQueuedKernel);
        let key_ptr = integrator.state.field_ptr(StateField::PathShaderSortKey);
        let bucket_ptr = integrator.counters.sort_key_counter_ptr(kernel);
        let counter_ptr = integrator.counters.counter_ptr();
        integrator.queue.write_words(tag_ptr, &tags).unwrap();
        integrator.queue.write_words(key_ptr, &keys).unwrap();
        integrator.queue.write_words(bucket_ptr, &[2, 1, 2]).unwrap();
        integrator.queue.write_words(counter_ptr, &counts).unwrap();
        integrator.counters.read_back(&mut integrator.queue).unwrap();
        integrator.max_active_path_index = keys.len();
        integrator.queue.clear_launch_log();

        assert!(integrator.enqueue_path_iteration().unwrap());
        assert_eq!(
            integrator.queue.launch_log(),
            &[
                (DeviceKernel::PrefixSum, 1),
                (DeviceKernel::IntegratorSortedPathsArray, 5),
                (kernel, 5),
            ]
        );
        let indices = integrator.queue.read_words(integrator.paths.indices_ptr()).unwrap();
        assert_eq!(&indices[..5], &[1, 4, 3, 0, 2]);
        let buckets = integrator.queue.read_words(bucket_ptr).unwrap();
        assert_eq!(&buckets[..3], &[0, 0, 0]);
    }

    #[test]
    fn short_queues_get_an_index_list() {
        let device = HostDevice::new(
            SyntheticKernels::default(),
            HostDeviceConfig {
                max_concurrent_states: 8,
                ..HostDeviceConfig::default()
            },
        );
        let mut integrator =
            WavefrontIntegrator::new(device, IntegratorConfig::default(), SceneInfo::default())
                .unwrap();
        integrator.set_buffers(BufferParams::new(4, 4)).unwrap();
        integrator.init_execution().unwrap();

        let kernel = DeviceKernel::IntegratorIntersectClosest;
        let none = crate::device::QUEUE_TAG_NONE;
        let tags = [none, kernel.queue_tag(), none, kernel.queue_tag()];
        let mut counts = [0u32; crate::device::NUM_INTEGRATOR_KERNELS];
        counts[kernel.integrator_index().unwrap()] = 2;
        let tag_ptr = integrator.state.field_ptr(StateField::PathQueuedKernel);
        let counter_ptr = integrator.counters.counter_ptr();
        integrator.queue.write_words(tag_ptr, &tags).unwrap();
        integrator.queue.write_words(counter_ptr, &counts).unwrap();
        integrator.counters.read_back(&mut integrator.queue).unwrap();
        integrator.max_active_path_index = tags.len();
        integrator.queue.clear_launch_log();

        assert!(integrator.enqueue_path_iteration().unwrap());
        assert_eq!(
            integrator.queue.launch_log(),
            &[(DeviceKernel::IntegratorQueuedPathsArray, 4), (kernel, 2)]
        );
        let indices = integrator.queue.read_words(integrator.paths.indices_ptr()).unwrap();
        assert_eq!(&indices[..2], &[1, 3]);
    }
}
