// src/path_tracing/tile_dispatch.rs
// Work tile scheduling over the (pixel region x sample range) domain of one render pass
// Hands out tiles no larger than the free path state budget, covering the domain exactly once

use bytemuck::{Pod, Zeroable};

use crate::path_tracing::film::BufferParams;

/// Tile as the init kernels read it
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelWorkTile {
    /// Full-frame pixel origin
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    pub start_sample: u32,
    pub num_samples: u32,
    /// Render buffer addressing, see [`BufferParams::pixel_index`]
    pub offset: i32,
    pub stride: i32,
    /// First state slot of this tile's paths, filled in on admission
    pub path_index_offset: u32,
    /// `w * h * num_samples`, filled in on admission
    pub work_size: u32,
}

impl KernelWorkTile {
    pub fn size(&self) -> usize {
        self.w as usize * self.h as usize * self.num_samples as usize
    }

    /// Full-frame pixel and sample of the tile-local path `local_index`
    pub fn work_pixel(&self, local_index: usize) -> (i32, i32, u32) {
        let area = self.w as usize * self.h as usize;
        let sample_offset = local_index / area;
        let pixel_offset = local_index - sample_offset * area;
        let y_offset = pixel_offset / self.w as usize;
        let x_offset = pixel_offset - y_offset * self.w as usize;
        (
            self.x + x_offset as i32,
            self.y + y_offset as i32,
            self.start_sample + sample_offset as u32,
        )
    }
}

/// Nominal tile dimensions and samples per tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSize {
    pub width: u32,
    pub height: u32,
    pub num_samples: u32,
}

impl TileSize {
    pub fn new(width: u32, height: u32, num_samples: u32) -> Self {
        Self {
            width,
            height,
            num_samples,
        }
    }
}

fn round_down_to_power_of_two(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        1 << (31 - value.leading_zeros())
    }
}

/// Pick a tile size so one tile of every sample chunk fits `max_num_path_states`.
///
/// Small square tiles with many samples keep neighbouring paths coherent; power of
/// two sizes pack evenly into the state budget.
pub fn tile_calculate_best_size(
    image_width: u32,
    image_height: u32,
    num_samples: u32,
    max_num_path_states: usize,
) -> TileSize {
    if max_num_path_states <= 1 {
        return TileSize::new(1, 1, 1);
    }

    let num_pixel_samples = image_width as usize * image_height as usize * num_samples as usize;
    if max_num_path_states >= num_pixel_samples {
        return TileSize::new(image_width, image_height, num_samples);
    }

    let per_sample = max_num_path_states / num_samples.max(1) as usize;
    let side = if per_sample != 0 {
        round_down_to_power_of_two((per_sample as f64).sqrt().round() as u32).max(1)
    } else {
        1
    };
    let mut tile = TileSize::new(side, side, 1);

    if num_samples > 1 {
        let chunk = (((num_samples / 2) as f64).sqrt().round() as u32)
            .max(1)
            .next_power_of_two()
            .min(num_samples);
        let area = side as usize * side as usize;
        let fit = (max_num_path_states / area).clamp(1, u32::MAX as usize) as u32;
        tile.num_samples = chunk.min(fit);
    }
    tile
}

/// Rectangle of the image grid, in image-relative pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Regular grid of tiles covering an image; edge tiles are clipped
#[derive(Debug, Clone, Copy)]
pub struct TileGrid {
    image_width: u32,
    image_height: u32,
    tile_width: u32,
    tile_height: u32,
}

impl TileGrid {
    pub fn new(image_width: u32, image_height: u32, tile_width: u32, tile_height: u32) -> Self {
        Self {
            image_width,
            image_height,
            tile_width: tile_width.max(1),
            tile_height: tile_height.max(1),
        }
    }

    pub fn tiles_x(&self) -> usize {
        self.image_width.div_ceil(self.tile_width) as usize
    }

    pub fn tiles_y(&self) -> usize {
        self.image_height.div_ceil(self.tile_height) as usize
    }

    pub fn total_tiles(&self) -> usize {
        self.tiles_x() * self.tiles_y()
    }

    /// Tile `index` in row-major order
    pub fn tile(&self, index: usize) -> Option<Tile> {
        if index >= self.total_tiles() {
            return None;
        }
        let tile_y = index / self.tiles_x();
        let tile_x = index - tile_y * self.tiles_x();
        let x = tile_x as u32 * self.tile_width;
        let y = tile_y as u32 * self.tile_height;
        Some(Tile {
            x,
            y,
            width: self.tile_width.min(self.image_width - x),
            height: self.tile_height.min(self.image_height - y),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.total_tiles()).filter_map(move |index| self.tile(index))
    }
}

/// Unit of pending work: an image rectangle times a sample range
#[derive(Debug, Clone, Copy)]
struct WorkUnit {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    start_sample: u32,
    num_samples: u32,
}

impl WorkUnit {
    fn size(&self) -> usize {
        self.w as usize * self.h as usize * self.num_samples as usize
    }

    fn with(self, x: u32, y: u32, w: u32, h: u32, start_sample: u32, num_samples: u32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            start_sample,
            num_samples,
        }
    }

    /// Split off a leading piece of at most `max_size` paths.
    ///
    /// Samples are shed first, then rows, then columns. Remainders are returned in
    /// the order they should be handed out.
    fn carve(self, max_size: usize) -> (WorkUnit, Vec<WorkUnit>) {
        let area = self.w as usize * self.h as usize;
        let mut rest = Vec::with_capacity(3);

        if area <= max_size {
            let samples = (max_size / area).min(self.num_samples as usize) as u32;
            let head = self.with(self.x, self.y, self.w, self.h, self.start_sample, samples);
            rest.push(self.with(
                self.x,
                self.y,
                self.w,
                self.h,
                self.start_sample + samples,
                self.num_samples - samples,
            ));
            return (head, rest);
        }

        let s = self.start_sample;
        let (head, row_rest) = if self.w as usize <= max_size {
            let rows = (max_size / self.w as usize) as u32;
            let head = self.with(self.x, self.y, self.w, rows, s, 1);
            let below = self.with(self.x, self.y + rows, self.w, self.h - rows, s, 1);
            (head, vec![below])
        } else {
            let cols = max_size as u32;
            let head = self.with(self.x, self.y, cols, 1, s, 1);
            let right = self.with(self.x + cols, self.y, self.w - cols, 1, s, 1);
            let below = self.with(self.x, self.y + 1, self.w, self.h - 1, s, 1);
            (head, vec![right, below])
        };
        rest.extend(row_rest);
        rest.push(self.with(self.x, self.y, self.w, self.h, s + 1, self.num_samples - 1));
        rest.retain(|unit| unit.size() > 0);
        (head, rest)
    }
}

/// Deterministic tile source for one render pass
#[derive(Debug, Default)]
pub struct WorkTileScheduler {
    max_num_path_states: usize,
    image_width: u32,
    image_height: u32,
    full_x: i32,
    full_y: i32,
    offset: i32,
    stride: i32,
    sample_start: u32,
    samples_num: u32,
    tile_size: Option<TileSize>,
    grid: Option<TileGrid>,
    num_sample_ranges: usize,
    total_tiles: usize,
    next_work_index: usize,
    /// Carved remainders, last element is handed out next
    pending: Vec<WorkUnit>,
}

impl WorkTileScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Soft ceiling the tile size heuristic plans for. Takes effect on the next reset.
    pub fn set_max_num_path_states(&mut self, max_num_path_states: usize) {
        self.max_num_path_states = max_num_path_states;
    }

    pub fn max_num_path_states(&self) -> usize {
        self.max_num_path_states
    }

    pub fn tile_size(&self) -> Option<TileSize> {
        self.tile_size
    }

    /// Restart the cursor over `samples_num` samples from `sample_start`
    pub fn reset(&mut self, params: &BufferParams, sample_start: u32, samples_num: u32) {
        self.image_width = params.width;
        self.image_height = params.height;
        self.full_x = params.full_x;
        self.full_y = params.full_y;
        self.offset = params.offset;
        self.stride = params.stride;
        self.sample_start = sample_start;
        self.samples_num = samples_num;
        self.pending.clear();
        self.next_work_index = 0;

        let tile = tile_calculate_best_size(
            params.width,
            params.height,
            samples_num,
            self.max_num_path_states.max(1),
        );
        let grid = TileGrid::new(params.width, params.height, tile.width, tile.height);
        self.num_sample_ranges = samples_num.div_ceil(tile.num_samples.max(1)) as usize;
        self.total_tiles = if samples_num == 0 {
            0
        } else {
            grid.total_tiles() * self.num_sample_ranges
        };
        self.tile_size = Some(tile);
        self.grid = Some(grid);

        log::debug!(
            "Work tiles {}x{}x{} samples, {} tiles for {}x{} pixels x {} samples",
            tile.width,
            tile.height,
            tile.num_samples,
            self.total_tiles,
            params.width,
            params.height,
            samples_num
        );
    }

    /// Whether every tile of the pass has been handed out
    pub fn is_exhausted(&self) -> bool {
        self.pending.is_empty() && self.next_work_index >= self.total_tiles
    }

    fn next_unit(&mut self) -> Option<WorkUnit> {
        if let Some(unit) = self.pending.pop() {
            return Some(unit);
        }
        let (grid, tile_size) = (self.grid?, self.tile_size?);
        if self.next_work_index >= self.total_tiles {
            return None;
        }
        let work_index = self.next_work_index;
        self.next_work_index += 1;

        let sample_range = work_index % self.num_sample_ranges;
        let start_sample = sample_range as u32 * tile_size.num_samples;
        let tile = grid.tile(work_index / self.num_sample_ranges)?;
        Some(WorkUnit {
            x: tile.x,
            y: tile.y,
            w: tile.width,
            h: tile.height,
            start_sample,
            num_samples: tile_size.num_samples.min(self.samples_num - start_sample),
        })
    }

    /// Next tile of at most `max_work_size` paths, or `None` when the pass is
    /// exhausted or `max_work_size` is zero.
    pub fn get_work(&mut self, max_work_size: usize) -> Option<KernelWorkTile> {
        if max_work_size == 0 {
            return None;
        }
        let unit = self.next_unit()?;
        let unit = if unit.size() > max_work_size {
            let (head, rest) = unit.carve(max_work_size);
            self.pending.extend(rest.into_iter().rev());
            head
        } else {
            unit
        };

        Some(KernelWorkTile {
            x: self.full_x + unit.x as i32,
            y: self.full_y + unit.y as i32,
            w: unit.w,
            h: unit.h,
            start_sample: self.sample_start + unit.start_sample,
            num_samples: unit.num_samples,
            offset: self.offset,
            stride: self.stride,
            path_index_offset: 0,
            work_size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_grid_partial() {
        let grid = TileGrid::new(640, 480, 256, 256);
        let tiles: Vec<_> = grid.iter().collect();
        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[2], Tile { x: 512, y: 0, width: 128, height: 256 });
        assert_eq!(tiles[5], Tile { x: 512, y: 256, width: 128, height: 224 });
        assert_eq!(grid.tile(6), None);
    }

    #[test]
    fn best_size_fits_the_state_budget() {
        assert_eq!(tile_calculate_best_size(64, 64, 4, 1 << 20), TileSize::new(64, 64, 4));
        assert_eq!(tile_calculate_best_size(64, 64, 4, 1), TileSize::new(1, 1, 1));

        let tile = tile_calculate_best_size(1920, 1080, 1024, 1 << 20);
        assert_eq!((tile.width, tile.height), (32, 32));
        assert_eq!(tile.num_samples, 32);
        assert!(tile.width as usize * tile.height as usize * tile.num_samples as usize <= 1 << 20);
    }

    #[test]
    fn zero_budget_yields_nothing() {
        let mut scheduler = WorkTileScheduler::new();
        scheduler.set_max_num_path_states(64);
        scheduler.reset(&BufferParams::new(8, 8), 0, 1);
        assert_eq!(scheduler.get_work(0), None);
        assert!(scheduler.get_work(64).is_some());
    }

    #[test]
    fn oversized_tiles_are_carved() {
        let mut scheduler = WorkTileScheduler::new();
        scheduler.set_max_num_path_states(1024);
        scheduler.reset(&BufferParams::new(8, 8), 0, 4);

        let first = scheduler.get_work(100).unwrap();
        assert_eq!((first.w, first.h, first.num_samples), (8, 8, 1));
        let second = scheduler.get_work(20).unwrap();
        assert_eq!((second.w, second.h, second.num_samples, second.start_sample), (8, 2, 1, 1));
        let third = scheduler.get_work(3).unwrap();
        assert_eq!((third.x, third.y, third.w, third.h), (0, 2, 3, 1));

        let mut covered = first.size() + second.size() + third.size();
        while let Some(tile) = scheduler.get_work(7) {
            assert!(tile.size() <= 7 && tile.size() > 0);
            covered += tile.size();
        }
        assert_eq!(covered, 8 * 8 * 4);
        assert!(scheduler.is_exhausted());
    }

    #[test]
    fn work_pixel_walks_pixels_then_samples() {
        let tile = KernelWorkTile {
            x: 2,
            y: 3,
            w: 2,
            h: 2,
            start_sample: 5,
            num_samples: 2,
            ..Default::default()
        };
        assert_eq!(tile.work_pixel(0), (2, 3, 5));
        assert_eq!(tile.work_pixel(3), (3, 4, 5));
        assert_eq!(tile.work_pixel(4), (2, 3, 6));
    }
}
