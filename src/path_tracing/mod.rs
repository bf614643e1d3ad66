// src/path_tracing/mod.rs
// Wavefront path tracing scheduler: film geometry, tiles, convergence, display and the integrator
// Kernels themselves live behind the device queue; this module decides what runs when

pub mod adaptive;
pub mod config;
pub mod display;
pub mod film;
pub mod tile_dispatch;
pub mod wavefront;

pub use adaptive::ConvergenceSampler;
pub use config::{DisplayUpdateMode, IntegratorConfig, SceneInfo};
pub use display::{DisplayStrategy, GpuDisplay};
pub use film::{BufferParams, FilmLayout, RenderBuffers};
pub use tile_dispatch::{KernelWorkTile, WorkTileScheduler};
pub use wavefront::{RenderStatistics, WavefrontIntegrator};
