// src/device/synthetic.rs
// Deterministic stand-in for the collaborator path tracing kernels
// Scene-free: hit/miss, shader ids and shadow occlusion all come from a per-path hash

use glam::Vec3;

use super::host::{HostIntegratorContext, PathKernels};
use super::DeviceKernel;
use crate::error::{RenderError, RenderResult};
use crate::path_tracing::tile_dispatch::KernelWorkTile;
use crate::path_tracing::wavefront::state::StateField;

const BACKGROUND: Vec3 = Vec3::splat(0.5);
const LIGHT: Vec3 = Vec3::splat(4.0);

fn hash_u32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Counters over everything the synthetic kernels did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyntheticStats {
    pub paths_started: usize,
    pub paths_terminated: usize,
    pub shadow_rays: usize,
    pub shadow_catcher_splits: usize,
    /// Splits whose target slot was out of range or still in use
    pub shadow_catcher_splits_dropped: usize,
    pub surface_evaluations: usize,
}

/// Hash-driven path kernels exercising every queue the scheduler manages
#[derive(Debug, Clone)]
pub struct SyntheticKernels {
    pub num_shaders: u32,
    pub max_bounces: u32,
    /// Split camera paths that hit the catcher into a second state
    pub shadow_catcher: bool,
    pub seed: u32,
    stats: SyntheticStats,
}

impl Default for SyntheticKernels {
    fn default() -> Self {
        Self::new(8, 4)
    }
}

impl SyntheticKernels {
    pub fn new(num_shaders: u32, max_bounces: u32) -> Self {
        Self {
            num_shaders: num_shaders.max(1),
            max_bounces: max_bounces.max(1),
            shadow_catcher: false,
            seed: 0x5eed,
            stats: SyntheticStats::default(),
        }
    }

    pub fn with_shadow_catcher(mut self, enabled: bool) -> Self {
        self.shadow_catcher = enabled;
        self
    }

    pub fn stats(&self) -> SyntheticStats {
        self.stats
    }

    fn random(&self, ctx: &HostIntegratorContext<'_>, slot: usize, salt: u32) -> RenderResult<u32> {
        let rng = ctx.read(StateField::PathRngHash, slot)?;
        let bounce = ctx.read(StateField::PathBounce, slot)?;
        Ok(hash_u32(rng ^ bounce.wrapping_mul(0x9e37_79b9) ^ salt))
    }

    fn pixel_index(ctx: &HostIntegratorContext<'_>, slot: usize) -> RenderResult<i64> {
        Ok(ctx.read(StateField::PathRenderPixelIndex, slot)? as i32 as i64)
    }

    /// Accumulate radiance into the combined pass and, for even samples, the half-sample pass
    fn write_radiance(
        ctx: &mut HostIntegratorContext<'_>,
        slot: usize,
        radiance: Vec3,
        sample: u32,
    ) -> RenderResult<()> {
        let pixel = Self::pixel_index(ctx, slot)?;
        let film = ctx.film();
        ctx.film_accumulate(pixel, film.pass_combined, &radiance.to_array())?;
        if sample % 2 == 0 {
            ctx.film_accumulate(pixel, film.pass_adaptive_aux, &(radiance * 2.0).to_array())?;
        }
        Ok(())
    }

    fn terminate(
        &mut self,
        ctx: &mut HostIntegratorContext<'_>,
        slot: usize,
        kernel: DeviceKernel,
        emission: Vec3,
    ) -> RenderResult<()> {
        let throughput = ctx.read_vec3(StateField::PathThroughput, slot)?;
        let sample = ctx.read(StateField::PathSample, slot)?;
        Self::write_radiance(ctx, slot, throughput * emission, sample)?;
        self.stats.paths_terminated += 1;
        ctx.path_terminate(slot, kernel)
    }

    fn intersect_closest(&mut self, ctx: &mut HostIntegratorContext<'_>, slot: usize) -> RenderResult<()> {
        let kernel = DeviceKernel::IntegratorIntersectClosest;
        let r = self.random(ctx, slot, 1)?;
        let bounce = ctx.read(StateField::PathBounce, slot)?;
        ctx.write_f32(StateField::IsectT, slot, 1.0 + (r % 97) as f32)?;
        ctx.write(StateField::IsectPrim, slot, r >> 8)?;

        match r % 16 {
            0..=3 => ctx.path_next(slot, kernel, DeviceKernel::IntegratorShadeBackground),
            4 => ctx.path_next(slot, kernel, DeviceKernel::IntegratorShadeLight),
            5 => ctx.path_next(slot, kernel, DeviceKernel::IntegratorShadeVolume),
            outcome => {
                if outcome == 6 && self.shadow_catcher && bounce == 0 {
                    self.split_shadow_catcher(ctx, slot)?;
                }
                let shader = (r >> 4) % self.num_shaders;
                let next = if shader % 5 == 4 {
                    DeviceKernel::IntegratorShadeSurfaceRaytrace
                } else {
                    DeviceKernel::IntegratorShadeSurface
                };
                ctx.path_next_sorted(slot, Some(kernel), next, shader)
            }
        }
    }

    /// Continue a copy of the camera path in the reserved upper half of the arena
    fn split_shadow_catcher(&mut self, ctx: &mut HostIntegratorContext<'_>, slot: usize) -> RenderResult<()> {
        let target = slot + ctx.capacity() / 2;
        if target >= ctx.capacity()
            || ctx.queued_kernel(target)?.is_some()
            || ctx.shadow_queued_kernel(target)?.is_some()
        {
            log::warn!("Shadow catcher split of slot {} dropped, target {} unavailable", slot, target);
            self.stats.shadow_catcher_splits_dropped += 1;
            return Ok(());
        }
        ctx.copy_state(slot, target)?;
        ctx.write(StateField::ShadowPathQueuedKernel, target, 0)?;
        ctx.write(StateField::PathQueuedKernel, target, 0)?;
        ctx.path_init(target, DeviceKernel::IntegratorShadeBackground)?;
        self.stats.shadow_catcher_splits += 1;
        Ok(())
    }

    fn shade(
        &mut self,
        ctx: &mut HostIntegratorContext<'_>,
        slot: usize,
        kernel: DeviceKernel,
    ) -> RenderResult<()> {
        let r = self.random(ctx, slot, 2)?;
        let bounce = ctx.read(StateField::PathBounce, slot)? + 1;
        let throughput = ctx.read_vec3(StateField::PathThroughput, slot)?;
        let shader = ctx.read(StateField::PathShaderSortKey, slot)?;
        let albedo = Vec3::splat(0.3 + 0.6 * ((shader % 4) as f32 / 4.0));
        let origin = ctx.read_vec3(StateField::RayOrigin, slot)?
            + ctx.read_vec3(StateField::RayDirection, slot)? * ctx.read_f32(StateField::IsectT, slot)?;

        if kernel != DeviceKernel::IntegratorShadeVolume {
            self.stats.surface_evaluations += 1;
        }

        if r % 3 != 0 && ctx.shadow_queued_kernel(slot)?.is_none() {
            let direction = Vec3::new(0.3, 1.0, 0.2).normalize();
            ctx.write_vec3(StateField::ShadowRayOrigin, slot, origin)?;
            ctx.write_vec3(StateField::ShadowRayDirection, slot, direction)?;
            ctx.write_f32(StateField::ShadowRayTmax, slot, 100.0)?;
            ctx.write_vec3(StateField::ShadowPathThroughput, slot, throughput * albedo * 0.25)?;
            ctx.shadow_path_init(slot, DeviceKernel::IntegratorIntersectShadow)?;
            self.stats.shadow_rays += 1;
        }

        if bounce >= self.max_bounces {
            return self.terminate(ctx, slot, kernel, Vec3::splat(0.05));
        }

        let direction = Vec3::new(
            ((r >> 8) & 0xff) as f32 / 255.0 - 0.5,
            1.0,
            ((r >> 16) & 0xff) as f32 / 255.0 - 0.5,
        )
        .normalize();
        ctx.write(StateField::PathBounce, slot, bounce)?;
        ctx.write_vec3(StateField::PathThroughput, slot, throughput * albedo)?;
        ctx.write_vec3(StateField::RayOrigin, slot, origin)?;
        ctx.write_vec3(StateField::RayDirection, slot, direction)?;
        ctx.write_f32(StateField::RayTmax, slot, f32::MAX)?;

        if kernel == DeviceKernel::IntegratorShadeSurface && shader % 7 == 6 {
            ctx.path_next(slot, kernel, DeviceKernel::IntegratorIntersectSubsurface)
        } else {
            ctx.path_next(slot, kernel, DeviceKernel::IntegratorIntersectClosest)
        }
    }
}

impl PathKernels for SyntheticKernels {
    fn init_path(
        &mut self,
        ctx: &mut HostIntegratorContext<'_>,
        kernel: DeviceKernel,
        tile: &KernelWorkTile,
        slot: usize,
        x: i32,
        y: i32,
        sample: u32,
    ) -> RenderResult<()> {
        let pixel = tile.offset as i64 + x as i64 + y as i64 * tile.stride as i64;
        let rng = hash_u32(hash_u32(pixel as u32 ^ self.seed) ^ sample);

        ctx.write(StateField::PathRenderPixelIndex, slot, pixel as i32 as u32)?;
        ctx.write(StateField::PathSample, slot, sample)?;
        ctx.write(StateField::PathBounce, slot, 0)?;
        ctx.write(StateField::PathFlag, slot, 0)?;
        ctx.write(StateField::PathRngHash, slot, rng)?;
        ctx.write(StateField::PathShaderSortKey, slot, 0)?;
        ctx.write_vec3(StateField::PathThroughput, slot, Vec3::ONE)?;
        ctx.write_vec3(StateField::RayOrigin, slot, Vec3::ZERO)?;
        let direction = Vec3::new(x as f32 * 0.01, y as f32 * 0.01, -1.0).normalize();
        ctx.write_vec3(StateField::RayDirection, slot, direction)?;
        ctx.write_f32(StateField::RayTmax, slot, f32::MAX)?;

        let film = ctx.film();
        ctx.film_add_sample(pixel)?;
        ctx.film_accumulate(pixel, film.pass_combined + 3, &[1.0])?;
        self.stats.paths_started += 1;

        let next = if kernel == DeviceKernel::IntegratorInitFromCamera && rng % 16 == 0 {
            DeviceKernel::IntegratorIntersectVolumeStack
        } else {
            DeviceKernel::IntegratorIntersectClosest
        };
        ctx.path_init(slot, next)
    }

    fn run_path(
        &mut self,
        ctx: &mut HostIntegratorContext<'_>,
        kernel: DeviceKernel,
        slot: usize,
    ) -> RenderResult<()> {
        match kernel {
            DeviceKernel::IntegratorIntersectVolumeStack => {
                ctx.path_next(slot, kernel, DeviceKernel::IntegratorIntersectClosest)
            }
            DeviceKernel::IntegratorIntersectClosest => self.intersect_closest(ctx, slot),
            DeviceKernel::IntegratorIntersectSubsurface => {
                let shader = ctx.read(StateField::PathShaderSortKey, slot)?;
                ctx.path_next_sorted(slot, Some(kernel), DeviceKernel::IntegratorShadeSurface, shader)
            }
            DeviceKernel::IntegratorShadeBackground => self.terminate(ctx, slot, kernel, BACKGROUND),
            DeviceKernel::IntegratorShadeLight => self.terminate(ctx, slot, kernel, LIGHT),
            DeviceKernel::IntegratorShadeSurface
            | DeviceKernel::IntegratorShadeSurfaceRaytrace
            | DeviceKernel::IntegratorShadeVolume => self.shade(ctx, slot, kernel),
            DeviceKernel::IntegratorIntersectShadow => {
                let r = self.random(ctx, slot, 3)?;
                if r % 2 == 0 {
                    ctx.shadow_path_terminate(slot, kernel)
                } else {
                    ctx.shadow_path_next(slot, kernel, DeviceKernel::IntegratorShadeShadow)
                }
            }
            DeviceKernel::IntegratorShadeShadow => {
                let throughput = ctx.read_vec3(StateField::ShadowPathThroughput, slot)?;
                let sample = ctx.read(StateField::PathSample, slot)?;
                Self::write_radiance(ctx, slot, throughput * LIGHT, sample)?;
                ctx.shadow_path_terminate(slot, kernel)
            }
            other => Err(RenderError::render(format!(
                "synthetic kernels cannot run {other} per path"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_mixes() {
        assert_eq!(hash_u32(7), hash_u32(7));
        assert_ne!(hash_u32(7), hash_u32(8));
        assert_ne!(hash_u32(1) & 0xff, hash_u32(2) & 0xff);
    }
}
