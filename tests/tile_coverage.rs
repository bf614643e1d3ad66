//! Work tile scheduler coverage: every (pixel, sample) pair is handed out exactly
//! once, whatever sequence of size limits the admission loop asks with.

use forge3d_wavefront::path_tracing::KernelWorkTile;
use forge3d_wavefront::{BufferParams, WorkTileScheduler};
use proptest::prelude::*;

struct Pass {
    width: u32,
    height: u32,
    full_x: i32,
    full_y: i32,
    sample_start: u32,
    samples_num: u32,
}

/// Drain the scheduler, cycling through `limits`, and count hits per (pixel, sample)
fn drain(scheduler: &mut WorkTileScheduler, pass: &Pass, limits: &[usize]) -> Result<Vec<u32>, TestCaseError> {
    let mut hits = vec![0u32; (pass.width * pass.height * pass.samples_num) as usize];
    let mut requests = 0usize;
    loop {
        let limit = limits[requests % limits.len()];
        requests += 1;
        prop_assert!(requests < 1_000_000, "scheduler never ran dry");

        let Some(tile) = scheduler.get_work(limit) else {
            if limit == 0 {
                continue;
            }
            break;
        };
        prop_assert!(limit > 0, "tile returned for a zero limit");
        prop_assert!(tile.size() >= 1);
        prop_assert!(tile.size() <= limit, "tile of {} for limit {}", tile.size(), limit);
        record(&mut hits, pass, &tile)?;
    }
    Ok(hits)
}

fn record(hits: &mut [u32], pass: &Pass, tile: &KernelWorkTile) -> Result<(), TestCaseError> {
    for sample in tile.start_sample..tile.start_sample + tile.num_samples {
        for y in tile.y..tile.y + tile.h as i32 {
            for x in tile.x..tile.x + tile.w as i32 {
                let (px, py) = (x - pass.full_x, y - pass.full_y);
                let s = sample.checked_sub(pass.sample_start);
                prop_assert!(px >= 0 && px < pass.width as i32, "x {} outside image", x);
                prop_assert!(py >= 0 && py < pass.height as i32, "y {} outside image", y);
                let s = s.filter(|s| *s < pass.samples_num);
                prop_assert!(s.is_some(), "sample {} outside pass", sample);
                let s = s.unwrap_or_default();
                let index = (s * pass.height + py as u32) * pass.width + px as u32;
                hits[index as usize] += 1;
            }
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn every_pixel_sample_is_covered_once(
        width in 1u32..40,
        height in 1u32..40,
        samples_num in 1u32..9,
        sample_start in 0u32..16,
        full_x in -8i32..8,
        full_y in -8i32..8,
        max_num_path_states in 1usize..2048,
        limits in prop::collection::vec(0usize..300, 1..24),
    ) {
        prop_assume!(limits.iter().any(|limit| *limit > 0));
        let params = BufferParams::new(width, height).with_full_offset(full_x, full_y);
        let mut scheduler = WorkTileScheduler::new();
        scheduler.set_max_num_path_states(max_num_path_states);
        scheduler.reset(&params, sample_start, samples_num);

        let pass = Pass { width, height, full_x, full_y, sample_start, samples_num };
        let hits = drain(&mut scheduler, &pass, &limits)?;
        prop_assert!(hits.iter().all(|count| *count == 1));
        prop_assert!(scheduler.is_exhausted());
    }

    #[test]
    fn tiles_carry_the_buffer_addressing(
        width in 1u32..32,
        height in 1u32..32,
        full_x in 0i32..16,
        full_y in 0i32..16,
    ) {
        let params = BufferParams::new(width, height).with_full_offset(full_x, full_y);
        let mut scheduler = WorkTileScheduler::new();
        scheduler.set_max_num_path_states(64);
        scheduler.reset(&params, 0, 2);
        while let Some(tile) = scheduler.get_work(64) {
            prop_assert_eq!(tile.offset, params.offset);
            prop_assert_eq!(tile.stride, params.stride);
            let index = tile.offset as i64 + tile.x as i64 + tile.y as i64 * tile.stride as i64;
            prop_assert!(index >= 0 && index < params.num_pixels() as i64);
        }
    }
}

#[test]
fn empty_pass_is_exhausted_immediately() {
    let mut scheduler = WorkTileScheduler::new();
    scheduler.set_max_num_path_states(16);
    scheduler.reset(&BufferParams::new(4, 4), 0, 0);
    assert!(scheduler.is_exhausted());
    assert_eq!(scheduler.get_work(16), None);
}
