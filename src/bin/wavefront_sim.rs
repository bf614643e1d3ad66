// src/bin/wavefront_sim.rs
// Full wavefront render on the host device with synthetic path kernels
// Prints per-batch scheduling statistics as JSON lines

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;

use forge3d_wavefront::{
    BufferParams, HostDevice, HostDeviceConfig, IntegratorConfig, RenderStatistics, SceneInfo,
    SyntheticKernels, WavefrontIntegrator,
};

const USAGE: &str = "usage: wavefront_sim [--width N] [--height N] [--samples N] [--batch N] \
[--states N] [--shaders N] [--bounces N] [--shadow-catcher] [--adaptive] [--config FILE]";

#[derive(Debug, Clone)]
struct SimArgs {
    width: u32,
    height: u32,
    samples: u32,
    batch: u32,
    states: usize,
    shaders: u32,
    bounces: u32,
    shadow_catcher: bool,
    adaptive: bool,
    config: Option<String>,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            samples: 16,
            batch: 4,
            states: 4096,
            shaders: 8,
            bounces: 4,
            shadow_catcher: false,
            adaptive: false,
            config: None,
        }
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], idx: usize, flag: &str) -> Result<T> {
    let raw = args
        .get(idx + 1)
        .ok_or_else(|| anyhow!("missing value for {flag}"))?;
    raw.parse::<T>()
        .map_err(|_| anyhow!("invalid value '{raw}' for {flag}"))
}

fn parse_args(args: &[String]) -> Result<SimArgs> {
    let mut sim = SimArgs::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let takes_value = match flag {
            "--width" => {
                sim.width = parse_value(args, i, flag)?;
                true
            }
            "--height" => {
                sim.height = parse_value(args, i, flag)?;
                true
            }
            "--samples" => {
                sim.samples = parse_value(args, i, flag)?;
                true
            }
            "--batch" => {
                sim.batch = parse_value(args, i, flag)?;
                true
            }
            "--states" => {
                sim.states = parse_value(args, i, flag)?;
                true
            }
            "--shaders" => {
                sim.shaders = parse_value(args, i, flag)?;
                true
            }
            "--bounces" => {
                sim.bounces = parse_value(args, i, flag)?;
                true
            }
            "--config" => {
                sim.config = Some(parse_value(args, i, flag)?);
                true
            }
            "--shadow-catcher" => {
                sim.shadow_catcher = true;
                false
            }
            "--adaptive" => {
                sim.adaptive = true;
                false
            }
            "-h" | "--help" => bail!("{USAGE}"),
            other => bail!("unknown argument '{other}'\n{USAGE}"),
        };
        i += if takes_value { 2 } else { 1 };
    }
    if sim.width == 0 || sim.height == 0 || sim.samples == 0 || sim.batch == 0 {
        bail!("width, height, samples and batch must be positive");
    }
    if sim.shaders == 0 {
        bail!("--shaders must be at least 1");
    }
    Ok(sim)
}

#[derive(Serialize)]
struct BatchReport {
    start_sample: u32,
    num_samples: u32,
    #[serde(flatten)]
    stats: RenderStatistics,
    active_pixels: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let sim = parse_args(&argv)?;

    let mut config = match &sim.config {
        Some(path) => IntegratorConfig::from_path(path)
            .with_context(|| format!("loading integrator config from {path}"))?,
        None => IntegratorConfig::default(),
    };
    config.max_num_paths = Some(config.max_num_paths.map_or(sim.states, |n| n.min(sim.states)));

    let scene = SceneInfo {
        max_shaders: sim.shaders as usize,
        has_shadow_catcher: sim.shadow_catcher,
        bake_mode: false,
    };
    let kernels = SyntheticKernels::new(sim.shaders, sim.bounces).with_shadow_catcher(sim.shadow_catcher);
    let device = HostDevice::new(
        kernels,
        HostDeviceConfig {
            max_concurrent_states: sim.states,
            ..Default::default()
        },
    );

    let adaptive_threshold = config.adaptive_threshold;
    let adaptive_min_samples = config.adaptive_min_samples;
    let mut integrator = WavefrontIntegrator::new(device, config, scene)?;
    integrator.set_buffers(BufferParams::new(sim.width, sim.height))?;

    let mut start = 0;
    while start < sim.samples {
        let num_samples = sim.batch.min(sim.samples - start);
        let stats = integrator.render_samples(start, num_samples)?;
        start += num_samples;

        let active_pixels = if sim.adaptive && start >= adaptive_min_samples {
            Some(integrator.adaptive_sampling_converge_filter_count_active(adaptive_threshold, false)?)
        } else {
            None
        };
        let report = BatchReport {
            start_sample: start - num_samples,
            num_samples,
            stats,
            active_pixels,
        };
        println!("{}", serde_json::to_string(&report)?);

        if active_pixels == Some(0) {
            log::info!("All pixels converged after {start} samples");
            break;
        }
    }

    let stats = integrator.queue().kernels().stats();
    log::info!(
        "Synthetic paths: {} started, {} terminated, {} shadow rays, {} catcher splits",
        stats.paths_started,
        stats.paths_terminated,
        stats.shadow_rays,
        stats.shadow_catcher_splits
    );
    Ok(())
}
