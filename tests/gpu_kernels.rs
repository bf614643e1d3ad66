//! wgpu backend smoke tests. Skipped when no adapter is available.

use std::sync::Arc;

use forge3d_wavefront::path_tracing::adaptive::ConvergenceSampler;
use forge3d_wavefront::path_tracing::wavefront::state::StateField;
use forge3d_wavefront::{
    BufferParams, DeviceKernel, DevicePtr, DeviceQueue, IntegratorConfig, KernelArgs,
    RenderBuffers, SceneInfo, WavefrontIntegrator, WgpuQueue, WgpuQueueConfig,
};
use wgpu::{Backends, Device, DeviceDescriptor, Instance, Queue, RequestAdapterOptions};

/// Test-only device creation helper (hermetic isolation)
async fn create_test_device() -> Option<(Arc<Device>, Arc<Queue>)> {
    let instance = Instance::new(wgpu::InstanceDescriptor {
        backends: Backends::all(),
        dx12_shader_compiler: Default::default(),
        flags: wgpu::InstanceFlags::default(),
        gles_minor_version: wgpu::Gles3MinorVersion::Automatic,
    });
    let adapter = instance
        .request_adapter(&RequestAdapterOptions::default())
        .await?;
    let (device, queue) = adapter
        .request_device(&DeviceDescriptor::default(), None)
        .await
        .ok()?;
    Some((Arc::new(device), Arc::new(queue)))
}

async fn test_queue() -> Option<WgpuQueue> {
    let Some((device, queue)) = create_test_device().await else {
        eprintln!("no wgpu adapter, skipping");
        return None;
    };
    let config = WgpuQueueConfig {
        heap_bytes: 4 << 20,
        max_concurrent_states: 256,
        busy_states: None,
    };
    Some(WgpuQueue::new(device, queue, config).expect("wgpu queue"))
}

fn upload(queue: &mut WgpuQueue, label: &str, words: &[u32]) -> DevicePtr {
    let ptr = queue.alloc(label, words.len() * 4).unwrap();
    queue.copy_to_device(ptr, bytemuck::cast_slice(words)).unwrap();
    ptr
}

fn download(queue: &mut dyn DeviceQueue, ptr: DevicePtr, len: usize) -> Vec<u32> {
    let mut words = vec![0u32; len];
    queue
        .copy_from_device(ptr, bytemuck::cast_slice_mut(&mut words))
        .unwrap();
    assert!(queue.synchronize());
    words
}

#[tokio::test]
async fn allocations_round_trip_and_zero() {
    let Some(mut queue) = test_queue().await else {
        return;
    };
    let first = upload(&mut queue, "first", &[1, 2, 3]);
    let second = upload(&mut queue, "second", &[7; 5]);
    assert_eq!(queue.mem_size(first).unwrap(), 12);
    assert_eq!(download(&mut queue, first, 3), vec![1, 2, 3]);

    queue.zero_to_device(second).unwrap();
    assert_eq!(download(&mut queue, second, 5), vec![0; 5]);
    assert_eq!(download(&mut queue, first, 3), vec![1, 2, 3]);
}

#[tokio::test]
async fn heap_exhaustion_is_reported() {
    let Some(mut queue) = test_queue().await else {
        return;
    };
    assert!(queue.alloc("too-big", 8 << 20).is_err());
    assert!(queue.alloc("fits", 1024).is_ok());
}

#[tokio::test]
async fn prefix_sum_is_exclusive() {
    let Some(mut queue) = test_queue().await else {
        return;
    };
    let counts = upload(&mut queue, "counts", &[3, 0, 2, 5]);
    let prefix = queue.alloc("prefix", 16).unwrap();
    let args = KernelArgs::new().ptr(counts).ptr(prefix).size(4);
    queue.enqueue(DeviceKernel::PrefixSum, 1, &args).unwrap();
    assert_eq!(download(&mut queue, prefix, 4), vec![0, 3, 3, 5]);
}

#[tokio::test]
async fn queued_paths_array_lists_matching_slots() {
    let Some(queue) = test_queue().await else {
        return;
    };
    let scene = SceneInfo {
        max_shaders: 4,
        has_shadow_catcher: false,
        bake_mode: false,
    };
    let config = IntegratorConfig {
        max_num_paths: Some(8),
        ..Default::default()
    };
    let mut integrator = WavefrontIntegrator::new(queue, config, scene).unwrap();
    integrator.init_execution().unwrap();
    assert_eq!(integrator.capacity(), 8);

    let tag = DeviceKernel::IntegratorIntersectClosest.queue_tag();
    let tags = [0, tag, 0, 0, tag, tag, 0, 0];
    let field = integrator.state().field_ptr(StateField::PathQueuedKernel);
    let indices = integrator.paths().indices_ptr();
    let count = integrator.paths().count_ptr();

    let queue = integrator.queue_mut();
    queue.copy_to_device(field, bytemuck::cast_slice(&tags)).unwrap();
    let args = KernelArgs::new().size(8).ptr(indices).ptr(count).int(tag as i32);
    queue
        .enqueue(DeviceKernel::IntegratorQueuedPathsArray, 8, &args)
        .unwrap();

    assert_eq!(download(queue, count, 1), vec![3]);
    let mut listed = download(queue, indices, 3);
    listed.sort_unstable();
    assert_eq!(listed, vec![1, 4, 5]);

    integrator.enqueue_reset().unwrap();
    let field = integrator.state().field_ptr(StateField::PathQueuedKernel);
    assert_eq!(download(integrator.queue_mut(), field, 8), vec![0; 8]);
    assert_eq!(integrator.read_queue_counters().unwrap().num_active_paths(), 0);
}

#[tokio::test]
async fn convergence_check_matches_the_host_rule() {
    let Some(mut queue) = test_queue().await else {
        return;
    };
    let mut buffers = RenderBuffers::new(BufferParams::new(4, 1));
    buffers.alloc(&mut queue).unwrap();

    let stride = buffers.params.layout.pass_stride as usize;
    for (pixel, values) in buffers.buffer.data_mut().chunks_exact_mut(stride).enumerate() {
        values[..4].copy_from_slice(&[4.0; 4]);
        values[4..7].copy_from_slice(if pixel == 2 { &[8.0, 0.0, 4.0] } else { &[4.0; 3] });
        values[8] = f32::from_bits(4);
    }
    buffers.buffer.copy_to_device(&mut queue).unwrap();

    let mut sampler = ConvergenceSampler::new();
    let active = sampler
        .converge_filter_count_active(&mut queue, &buffers, 0.01, false)
        .unwrap();
    assert_eq!(active, 1);

    buffers.copy_from_device(&mut queue).unwrap();
    assert!(queue.synchronize());
    let flags: Vec<f32> = buffers
        .buffer
        .data()
        .chunks_exact(stride)
        .map(|pixel| pixel[7])
        .collect();
    assert_eq!(flags, vec![1.0, 0.0, 0.0, 0.0]);
}
