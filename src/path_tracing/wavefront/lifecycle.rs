// src/path_tracing/wavefront/lifecycle.rs
// Work tile admission into path state slots, and compaction of fragmented slots

use super::WavefrontIntegrator;
use crate::device::{DeviceKernel, DevicePtr, DeviceQueue, KernelArgs};
use crate::error::{RenderError, RenderResult};
use crate::path_tracing::tile_dispatch::KernelWorkTile;

/// Result of one admission attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmitOutcome {
    /// An init kernel was launched; counters must be read back
    pub enqueued: bool,
    /// No tiles remain and no path is active
    pub finished: bool,
}

impl<Q: DeviceQueue> WavefrontIntegrator<Q> {
    /// Slots reserved above the camera paths for shadow catcher splits
    fn shadow_catcher_state_offset(&self) -> usize {
        if self.scene.has_shadow_catcher {
            self.state.capacity() / 2
        } else {
            0
        }
    }

    /// Camera paths fit in `[0, offset)` so every split target `slot + offset`
    /// stays clear of them, also for an odd capacity.
    pub fn max_num_camera_paths(&self) -> usize {
        match self.shadow_catcher_state_offset() {
            0 => self.state.capacity(),
            offset => offset,
        }
    }

    /// Admit new work tiles when the in-flight paths allow it.
    ///
    /// Reads only the host copy of the counters, so they must have been read
    /// back after the last launch.
    pub fn enqueue_work_tiles(&mut self) -> RenderResult<AdmitOutcome> {
        let counts = self.counters.counts();
        let num_active = counts.num_active_paths();

        if self.is_cancelled() {
            return Ok(AdmitOutcome {
                enqueued: false,
                finished: num_active == 0,
            });
        }
        if num_active == 0 {
            self.max_active_path_index = 0;
        }

        // New paths join in-flight ones at intersect closest only
        let other_queued = DeviceKernel::INTEGRATOR.iter().any(|kernel| {
            *kernel != DeviceKernel::IntegratorIntersectClosest && counts.get(*kernel) > 0
        });
        if other_queued {
            return Ok(AdmitOutcome::default());
        }

        let busy = self.queue.num_concurrent_busy_states();
        if num_active != 0 && num_active >= busy {
            return Ok(AdmitOutcome::default());
        }

        let capacity = self.state.capacity();
        let offset = self.shadow_catcher_state_offset();
        let max_camera = self.max_num_camera_paths();
        let base = if offset == 0 {
            num_active
        } else {
            self.max_active_path_index.saturating_sub(offset)
        };
        let room = max_camera.saturating_sub(base);

        let mut tiles = Vec::new();
        let mut num_paths = 0usize;
        while num_paths < room {
            let Some(mut tile) = self.tile_scheduler.get_work(room - num_paths) else {
                break;
            };
            tile.path_index_offset = (base + num_paths) as u32;
            tile.work_size = tile.size() as u32;
            num_paths += tile.size();
            tiles.push(tile);
        }

        if tiles.is_empty() {
            return Ok(AdmitOutcome {
                enqueued: false,
                finished: num_active == 0,
            });
        }

        self.compact_states(num_active)?;
        self.enqueue_init(&tiles)?;
        self.max_active_path_index = capacity.min(base + num_paths + offset);
        self.stats.tiles_admitted += tiles.len();
        self.stats.paths_admitted += num_paths;

        log::debug!(
            "Admitted {} tiles ({} paths) at slot {}, {} already active, max active index {}",
            tiles.len(),
            num_paths,
            base,
            num_active,
            self.max_active_path_index
        );
        Ok(AdmitOutcome {
            enqueued: true,
            finished: false,
        })
    }

    fn enqueue_init(&mut self, tiles: &[KernelWorkTile]) -> RenderResult<()> {
        let render_buffer = self
            .buffers
            .as_ref()
            .map(|buffers| buffers.device_pointer())
            .unwrap_or(DevicePtr::NULL);
        if render_buffer.is_null() {
            return Err(RenderError::render("work tiles admitted without a render buffer"));
        }

        if self.work_tiles.len() < tiles.len() {
            self.work_tiles.alloc(&mut self.queue, tiles.len())?;
        }
        self.work_tiles.data_mut()[..tiles.len()].copy_from_slice(tiles);
        self.work_tiles.copy_to_device(&mut self.queue)?;

        let max_tile_work_size = tiles.iter().map(|tile| tile.size()).max().unwrap_or(0);
        let kernel = if self.scene.bake_mode {
            DeviceKernel::IntegratorInitFromBake
        } else {
            DeviceKernel::IntegratorInitFromCamera
        };
        let args = KernelArgs::new()
            .ptr(self.work_tiles.device_pointer())
            .size(tiles.len())
            .ptr(render_buffer)
            .size(max_tile_work_size);
        self.queue
            .enqueue(kernel, max_tile_work_size * tiles.len(), &args)
    }

    /// Move active states above `num_active_paths` into the holes below it, so
    /// that slots `0..num_active_paths` are exactly the active ones.
    ///
    /// Skipped with a shadow catcher: split states live at fixed offsets from
    /// their camera path.
    pub fn compact_states(&mut self, num_active_paths: usize) -> RenderResult<()> {
        if self.scene.has_shadow_catcher {
            return Ok(());
        }
        if num_active_paths == 0 {
            self.max_active_path_index = 0;
            return Ok(());
        }
        let max_active_path_index = self.max_active_path_index;
        if max_active_path_index <= num_active_paths {
            return Ok(());
        }

        let capacity = self.state.capacity();
        self.paths.zero_counts(&mut self.queue)?;

        // Holes below the new mark go after the overflow list
        let terminated_args = KernelArgs::new()
            .size(num_active_paths)
            .ptr(self.paths.indices_ptr())
            .ptr(self.paths.terminated_count_ptr())
            .size(num_active_paths);
        self.queue.enqueue(
            DeviceKernel::IntegratorTerminatedPathsArray,
            num_active_paths,
            &terminated_args,
        )?;

        let compact_args = KernelArgs::new()
            .size(max_active_path_index)
            .ptr(self.paths.indices_ptr())
            .ptr(self.paths.count_ptr())
            .size(num_active_paths);
        self.queue.enqueue(
            DeviceKernel::IntegratorCompactPathsArray,
            max_active_path_index,
            &compact_args,
        )?;

        let (num_overflow, num_holes) = self.paths.read_counts(&mut self.queue)?;
        let num_compact = num_overflow
            .min(num_holes)
            .min(capacity.saturating_sub(num_active_paths));
        if num_compact > 0 {
            let args = KernelArgs::new()
                .ptr(self.paths.indices_ptr())
                .size(0)
                .size(num_active_paths)
                .size(num_compact);
            self.queue
                .enqueue(DeviceKernel::IntegratorCompactStates, num_compact, &args)?;
        }

        log::debug!(
            "Compacted {} states, max active index {} -> {}",
            num_compact,
            max_active_path_index,
            num_active_paths
        );
        self.stats.compactions += 1;
        self.max_active_path_index = num_active_paths;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::{HostDevice, HostDeviceConfig};
    use crate::device::synthetic::SyntheticKernels;
    use crate::device::QUEUE_TAG_NONE;
    use crate::path_tracing::config::{IntegratorConfig, SceneInfo};
    use crate::path_tracing::wavefront::state::StateField;
    use proptest::prelude::*;

    fn integrator(capacity: usize, scene: SceneInfo) -> WavefrontIntegrator<HostDevice<SyntheticKernels>> {
        let device = HostDevice::new(
            SyntheticKernels::default(),
            HostDeviceConfig {
                max_concurrent_states: capacity,
                ..HostDeviceConfig::default()
            },
        );
        let mut integrator =
            WavefrontIntegrator::new(device, IntegratorConfig::default(), scene).unwrap();
        integrator.init_execution().unwrap();
        integrator
    }

    fn label_slots(
        integrator: &mut WavefrontIntegrator<HostDevice<SyntheticKernels>>,
        active: &[bool],
    ) {
        let tag = DeviceKernel::IntegratorIntersectClosest.queue_tag();
        let tags: Vec<u32> = active
            .iter()
            .map(|active| if *active { tag } else { QUEUE_TAG_NONE })
            .collect();
        let ids: Vec<u32> = (0..active.len() as u32).map(|slot| 1000 + slot).collect();
        let tag_ptr = integrator.state.field_ptr(StateField::PathQueuedKernel);
        let rng_ptr = integrator.state.field_ptr(StateField::PathRngHash);
        integrator.queue.write_words(tag_ptr, &tags).unwrap();
        integrator.queue.write_words(rng_ptr, &ids).unwrap();
        integrator.max_active_path_index = active.len();
    }

    #[test]
    fn compaction_packs_active_states_below_the_count() {
        let mut integrator = integrator(16, SceneInfo::default());
        let active = [
            true, false, false, true, false, true, true, false, true, false, true, false,
        ];
        label_slots(&mut integrator, &active);
        let expected: Vec<u32> = active
            .iter()
            .enumerate()
            .filter(|(_, active)| **active)
            .map(|(slot, _)| 1000 + slot as u32)
            .collect();
        let num_active = expected.len();

        integrator.compact_states(num_active).unwrap();
        assert_eq!(integrator.max_active_path_index(), num_active);

        let tags = integrator
            .queue
            .read_words(integrator.state.field_ptr(StateField::PathQueuedKernel))
            .unwrap();
        let ids = integrator
            .queue
            .read_words(integrator.state.field_ptr(StateField::PathRngHash))
            .unwrap();
        assert!(tags[..num_active].iter().all(|tag| *tag != QUEUE_TAG_NONE));
        assert!(tags[num_active..].iter().all(|tag| *tag == QUEUE_TAG_NONE));

        let mut moved: Vec<u32> = ids[..num_active].to_vec();
        moved.sort_unstable();
        assert_eq!(moved, expected);
    }

    #[test]
    fn dense_states_are_left_alone() {
        let mut integrator = integrator(8, SceneInfo::default());
        label_slots(&mut integrator, &[true, true, true, false]);
        integrator.max_active_path_index = 3;
        integrator.queue.clear_launch_log();
        integrator.compact_states(3).unwrap();
        assert!(integrator.queue.launch_log().is_empty());
        assert_eq!(integrator.max_active_path_index(), 3);
    }

    #[test]
    fn shadow_catcher_disables_compaction() {
        let scene = SceneInfo {
            has_shadow_catcher: true,
            ..SceneInfo::default()
        };
        let mut integrator = integrator(16, scene);
        label_slots(&mut integrator, &[false, true, false, true, false, true]);
        integrator.compact_states(3).unwrap();
        assert_eq!(integrator.max_active_path_index(), 6);
        integrator.compact_states(0).unwrap();
        assert_eq!(integrator.max_active_path_index(), 6);
    }

    /// Slot occupancy for compaction: (main path queued, shadow ray queued)
    fn label_main_and_shadow(
        integrator: &mut WavefrontIntegrator<HostDevice<SyntheticKernels>>,
        labels: &[(bool, bool)],
    ) {
        let main_tag = DeviceKernel::IntegratorIntersectClosest.queue_tag();
        let shadow_tag = DeviceKernel::IntegratorIntersectShadow.queue_tag();
        let main: Vec<u32> = labels
            .iter()
            .map(|(main, _)| if *main { main_tag } else { QUEUE_TAG_NONE })
            .collect();
        let shadow: Vec<u32> = labels
            .iter()
            .map(|(_, shadow)| if *shadow { shadow_tag } else { QUEUE_TAG_NONE })
            .collect();
        let ids: Vec<u32> = (0..labels.len() as u32).map(|slot| 1000 + slot).collect();
        for (field, words) in [
            (StateField::PathQueuedKernel, &main),
            (StateField::ShadowPathQueuedKernel, &shadow),
            (StateField::PathRngHash, &ids),
        ] {
            let ptr = integrator.state.field_ptr(field);
            integrator.queue.write_words(ptr, words).unwrap();
        }
        integrator.max_active_path_index = labels.len();
    }

    proptest! {
        #[test]
        fn compaction_packs_any_labeling(
            (capacity, labels) in (1usize..48).prop_flat_map(|capacity| {
                (
                    Just(capacity),
                    prop::collection::vec((any::<bool>(), any::<bool>()), 0..=capacity),
                )
            })
        ) {
            let mut integrator = integrator(capacity, SceneInfo::default());
            label_main_and_shadow(&mut integrator, &labels);
            let active: Vec<usize> = (0..labels.len())
                .filter(|slot| labels[*slot].0 || labels[*slot].1)
                .collect();
            let num_active = active.len();

            integrator.compact_states(num_active).unwrap();
            prop_assert_eq!(integrator.max_active_path_index(), num_active);

            let read = |field: StateField| {
                integrator
                    .queue
                    .read_words(integrator.state.field_ptr(field))
                    .unwrap()
            };
            let main = read(StateField::PathQueuedKernel);
            let shadow = read(StateField::ShadowPathQueuedKernel);
            let ids = read(StateField::PathRngHash);

            for slot in num_active..capacity {
                prop_assert_eq!(main[slot], QUEUE_TAG_NONE);
                prop_assert_eq!(shadow[slot], QUEUE_TAG_NONE);
            }
            let mut moved: Vec<usize> = ids[..num_active]
                .iter()
                .map(|id| *id as usize - 1000)
                .collect();
            // Each state keeps its own main and shadow tags
            for (slot, origin) in moved.iter().enumerate() {
                let (has_main, has_shadow) = labels[*origin];
                prop_assert_eq!(main[slot] != QUEUE_TAG_NONE, has_main);
                prop_assert_eq!(shadow[slot] != QUEUE_TAG_NONE, has_shadow);
            }
            moved.sort_unstable();
            prop_assert_eq!(moved, active);
        }
    }
}
