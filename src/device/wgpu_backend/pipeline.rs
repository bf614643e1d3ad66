// src/device/wgpu_backend/pipeline.rs
// Compute pipelines of the scheduler kernels, one WGSL entry point per kernel
// All kernels share one layout: a parameter block and the device heap

use std::collections::HashMap;

use wgpu::{BindGroupLayout, ComputePipeline, Device, PipelineLayout};

use crate::device::DeviceKernel;
use crate::error::{RenderError, RenderResult};

const COMMON_WGSL: &str = include_str!("../../shaders/wavefront_common.wgsl");

/// Built-in kernel sources and the kernels each one defines
const BUILTIN_SOURCES: &[(&str, &str, &[DeviceKernel])] = &[
    (
        "integrator-arrays",
        include_str!("../../shaders/integrator_arrays.wgsl"),
        &[
            DeviceKernel::IntegratorReset,
            DeviceKernel::IntegratorQueuedPathsArray,
            DeviceKernel::IntegratorQueuedShadowPathsArray,
            DeviceKernel::IntegratorTerminatedPathsArray,
            DeviceKernel::IntegratorCompactPathsArray,
            DeviceKernel::IntegratorCompactStates,
            DeviceKernel::IntegratorSortedPathsArray,
        ],
    ),
    (
        "prefix-sum",
        include_str!("../../shaders/prefix_sum.wgsl"),
        &[DeviceKernel::PrefixSum],
    ),
    (
        "adaptive-sampling",
        include_str!("../../shaders/adaptive_sampling.wgsl"),
        &[
            DeviceKernel::AdaptiveSamplingConvergenceCheck,
            DeviceKernel::AdaptiveSamplingFilterX,
            DeviceKernel::AdaptiveSamplingFilterY,
        ],
    ),
    (
        "film-convert",
        include_str!("../../shaders/film_convert.wgsl"),
        &[DeviceKernel::FilmConvertHalfRgba],
    ),
];

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Every compiled kernel, keyed by identity
pub struct KernelPipelines {
    pub bind_group_layout: BindGroupLayout,
    pipeline_layout: PipelineLayout,
    pipelines: HashMap<DeviceKernel, ComputePipeline>,
}

impl KernelPipelines {
    /// Compile every built-in kernel
    pub fn new(device: &Device) -> RenderResult<Self> {
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("wavefront-kernel-bgl"),
            entries: &[
                // Parameter block
                storage_entry(0, true),
                // Device heap
                storage_entry(1, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("wavefront-kernel-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let mut pipelines = Self {
            bind_group_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
        };
        for (label, source, kernels) in BUILTIN_SOURCES {
            pipelines.compile(device, label, source, kernels)?;
        }
        log::debug!("Compiled {} wavefront kernels", pipelines.pipelines.len());
        Ok(pipelines)
    }

    /// Compile `source` against the shared prelude and register an entry
    /// point named after each of `kernels`
    pub fn compile(
        &mut self,
        device: &Device,
        label: &str,
        source: &str,
        kernels: &[DeviceKernel],
    ) -> RenderResult<()> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(format!("{COMMON_WGSL}\n{source}").into()),
        });
        let compiled: Vec<(DeviceKernel, ComputePipeline)> = kernels
            .iter()
            .map(|kernel| {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kernel.as_str()),
                    layout: Some(&self.pipeline_layout),
                    module: &shader,
                    entry_point: kernel.as_str(),
                });
                (*kernel, pipeline)
            })
            .collect();
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(RenderError::device(format!(
                "compiling '{label}' failed: {err}"
            )));
        }
        self.pipelines.extend(compiled);
        Ok(())
    }

    pub fn get(&self, kernel: DeviceKernel) -> RenderResult<&ComputePipeline> {
        self.pipelines
            .get(&kernel)
            .ok_or_else(|| RenderError::render(format!("no compute pipeline for {kernel}")))
    }

    pub fn contains(&self, kernel: DeviceKernel) -> bool {
        self.pipelines.contains_key(&kernel)
    }
}
