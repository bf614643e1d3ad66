// src/device/kernel.rs
// Device kernel identities and their scheduling classification
// Integrator kernels come first: their discriminant doubles as the queue counter index

use std::fmt;

/// Identity of one GPU compute kernel.
///
/// The first [`NUM_INTEGRATOR_KERNELS`] variants are the kernels a path state can
/// queue itself for. Their order is the tie-break order of the most-queued kernel
/// search, so it must not be shuffled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKernel {
    IntegratorInitFromCamera = 0,
    IntegratorInitFromBake,
    IntegratorIntersectClosest,
    IntegratorIntersectShadow,
    IntegratorIntersectSubsurface,
    IntegratorIntersectVolumeStack,
    IntegratorShadeBackground,
    IntegratorShadeLight,
    IntegratorShadeShadow,
    IntegratorShadeSurface,
    IntegratorShadeSurfaceRaytrace,
    IntegratorShadeVolume,
    IntegratorMegakernel,

    // Utility kernels owned by the scheduler
    IntegratorReset,
    IntegratorQueuedPathsArray,
    IntegratorQueuedShadowPathsArray,
    IntegratorTerminatedPathsArray,
    IntegratorSortedPathsArray,
    IntegratorCompactPathsArray,
    IntegratorCompactStates,
    PrefixSum,

    AdaptiveSamplingConvergenceCheck,
    AdaptiveSamplingFilterX,
    AdaptiveSamplingFilterY,

    FilmConvertHalfRgba,
}

/// Number of kernels that own a queue in the counter table
pub const NUM_INTEGRATOR_KERNELS: usize = DeviceKernel::IntegratorMegakernel as usize + 1;

/// Queue tag stored in a state slot that is not queued for any kernel
pub const QUEUE_TAG_NONE: u32 = 0;

impl DeviceKernel {
    /// Integrator kernels in counter-table order
    pub const INTEGRATOR: [DeviceKernel; NUM_INTEGRATOR_KERNELS] = [
        DeviceKernel::IntegratorInitFromCamera,
        DeviceKernel::IntegratorInitFromBake,
        DeviceKernel::IntegratorIntersectClosest,
        DeviceKernel::IntegratorIntersectShadow,
        DeviceKernel::IntegratorIntersectSubsurface,
        DeviceKernel::IntegratorIntersectVolumeStack,
        DeviceKernel::IntegratorShadeBackground,
        DeviceKernel::IntegratorShadeLight,
        DeviceKernel::IntegratorShadeShadow,
        DeviceKernel::IntegratorShadeSurface,
        DeviceKernel::IntegratorShadeSurfaceRaytrace,
        DeviceKernel::IntegratorShadeVolume,
        DeviceKernel::IntegratorMegakernel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKernel::IntegratorInitFromCamera => "integrator_init_from_camera",
            DeviceKernel::IntegratorInitFromBake => "integrator_init_from_bake",
            DeviceKernel::IntegratorIntersectClosest => "integrator_intersect_closest",
            DeviceKernel::IntegratorIntersectShadow => "integrator_intersect_shadow",
            DeviceKernel::IntegratorIntersectSubsurface => "integrator_intersect_subsurface",
            DeviceKernel::IntegratorIntersectVolumeStack => "integrator_intersect_volume_stack",
            DeviceKernel::IntegratorShadeBackground => "integrator_shade_background",
            DeviceKernel::IntegratorShadeLight => "integrator_shade_light",
            DeviceKernel::IntegratorShadeShadow => "integrator_shade_shadow",
            DeviceKernel::IntegratorShadeSurface => "integrator_shade_surface",
            DeviceKernel::IntegratorShadeSurfaceRaytrace => "integrator_shade_surface_raytrace",
            DeviceKernel::IntegratorShadeVolume => "integrator_shade_volume",
            DeviceKernel::IntegratorMegakernel => "integrator_megakernel",
            DeviceKernel::IntegratorReset => "integrator_reset",
            DeviceKernel::IntegratorQueuedPathsArray => "integrator_queued_paths_array",
            DeviceKernel::IntegratorQueuedShadowPathsArray => "integrator_queued_shadow_paths_array",
            DeviceKernel::IntegratorTerminatedPathsArray => "integrator_terminated_paths_array",
            DeviceKernel::IntegratorSortedPathsArray => "integrator_sorted_paths_array",
            DeviceKernel::IntegratorCompactPathsArray => "integrator_compact_paths_array",
            DeviceKernel::IntegratorCompactStates => "integrator_compact_states",
            DeviceKernel::PrefixSum => "prefix_sum",
            DeviceKernel::AdaptiveSamplingConvergenceCheck => "adaptive_sampling_convergence_check",
            DeviceKernel::AdaptiveSamplingFilterX => "adaptive_sampling_filter_x",
            DeviceKernel::AdaptiveSamplingFilterY => "adaptive_sampling_filter_y",
            DeviceKernel::FilmConvertHalfRgba => "film_convert_half_rgba",
        }
    }

    /// Index into the queue counter table, for kernels that own a queue
    pub fn integrator_index(self) -> Option<usize> {
        let index = self as usize;
        (index < NUM_INTEGRATOR_KERNELS).then_some(index)
    }

    pub fn from_integrator_index(index: usize) -> Option<DeviceKernel> {
        Self::INTEGRATOR.get(index).copied()
    }

    /// Tag a state slot stores to request this kernel next
    pub fn queue_tag(self) -> u32 {
        match self.integrator_index() {
            Some(index) => index as u32 + 1,
            None => QUEUE_TAG_NONE,
        }
    }

    pub fn from_queue_tag(tag: u32) -> Option<DeviceKernel> {
        if tag == QUEUE_TAG_NONE {
            return None;
        }
        Self::from_integrator_index(tag as usize - 1)
    }

    /// Kernels that run with the render buffer bound
    pub fn is_shading(self) -> bool {
        matches!(
            self,
            DeviceKernel::IntegratorShadeBackground
                | DeviceKernel::IntegratorShadeLight
                | DeviceKernel::IntegratorShadeShadow
                | DeviceKernel::IntegratorShadeSurface
                | DeviceKernel::IntegratorShadeSurfaceRaytrace
                | DeviceKernel::IntegratorShadeVolume
        )
    }

    /// Material evaluation kernels whose active list is bucketed by shader
    pub fn uses_shader_sorting(self) -> bool {
        matches!(
            self,
            DeviceKernel::IntegratorShadeSurface | DeviceKernel::IntegratorShadeSurfaceRaytrace
        )
    }

    /// Kernels that may queue a shadow ray into the single per-slot shadow state
    pub fn creates_shadow_paths(self) -> bool {
        matches!(
            self,
            DeviceKernel::IntegratorShadeSurface
                | DeviceKernel::IntegratorShadeSurfaceRaytrace
                | DeviceKernel::IntegratorShadeVolume
        )
    }

    /// Kernels whose queue is tracked by the shadow next-kernel tag
    pub fn is_shadow(self) -> bool {
        matches!(
            self,
            DeviceKernel::IntegratorIntersectShadow | DeviceKernel::IntegratorShadeShadow
        )
    }
}

impl fmt::Display for DeviceKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrator_table_matches_discriminants() {
        for (index, kernel) in DeviceKernel::INTEGRATOR.iter().enumerate() {
            assert_eq!(kernel.integrator_index(), Some(index));
            assert_eq!(DeviceKernel::from_integrator_index(index), Some(*kernel));
        }
        assert_eq!(DeviceKernel::PrefixSum.integrator_index(), None);
    }

    #[test]
    fn queue_tags_round_trip() {
        for kernel in DeviceKernel::INTEGRATOR {
            let tag = kernel.queue_tag();
            assert_ne!(tag, QUEUE_TAG_NONE);
            assert_eq!(DeviceKernel::from_queue_tag(tag), Some(kernel));
        }
        assert_eq!(DeviceKernel::from_queue_tag(QUEUE_TAG_NONE), None);
        assert_eq!(DeviceKernel::IntegratorCompactStates.queue_tag(), QUEUE_TAG_NONE);
    }

    #[test]
    fn shadow_rays_come_from_surface_and_volume_shading() {
        assert!(DeviceKernel::IntegratorShadeVolume.creates_shadow_paths());
        assert!(!DeviceKernel::IntegratorShadeVolume.uses_shader_sorting());
        assert!(!DeviceKernel::IntegratorShadeBackground.creates_shadow_paths());
        assert!(DeviceKernel::IntegratorShadeShadow.is_shadow());
    }
}
