//! Adaptive sampling mask and display updates on the host device

use half::f16;

use forge3d_wavefront::{
    BufferParams, DeviceKernel, DevicePtr, DeviceQueue, DisplayStrategy, DisplayUpdateMode,
    GpuDisplay, HostDevice, HostDeviceConfig, IntegratorConfig, RenderResult, SceneInfo, SyntheticKernels,
    WavefrontIntegrator,
};

type HostIntegrator = WavefrontIntegrator<HostDevice<SyntheticKernels>>;

const PASS_STRIDE: usize = 9;
const AUX: usize = 4;
const SAMPLE_COUNT: usize = 8;

fn integrator(config: IntegratorConfig, interop: bool, width: u32, height: u32) -> HostIntegrator {
    let device = HostDevice::new(
        SyntheticKernels::new(2, 2),
        HostDeviceConfig {
            max_concurrent_states: 64,
            graphics_interop: interop,
            ..Default::default()
        },
    );
    let scene = SceneInfo {
        max_shaders: 2,
        has_shadow_catcher: false,
        bake_mode: false,
    };
    let mut integrator = WavefrontIntegrator::new(device, config, scene).unwrap();
    integrator.set_buffers(BufferParams::new(width, height)).unwrap();
    integrator
}

/// One pixel of film: combined, half-sample aux with its converged flag, sample count
fn pixel_words(combined: [f32; 4], aux: [f32; 3], converged: bool, samples: u32) -> Vec<u32> {
    let mut words = vec![0u32; PASS_STRIDE];
    for c in 0..4 {
        words[c] = combined[c].to_bits();
    }
    for c in 0..3 {
        words[AUX + c] = aux[c].to_bits();
    }
    words[AUX + 3] = if converged { 1.0f32 } else { 0.0f32 }.to_bits();
    words[SAMPLE_COUNT] = samples;
    words
}

fn write_film(integrator: &mut HostIntegrator, pixels: &[Vec<u32>]) {
    let ptr = integrator.render_buffers().unwrap().device_pointer();
    let words: Vec<u32> = pixels.concat();
    integrator.queue_mut().write_words(ptr, &words).unwrap();
}

fn converged_flags(integrator: &mut HostIntegrator) -> Vec<f32> {
    let buffers = integrator.read_render_buffers().unwrap();
    buffers
        .buffer
        .data()
        .chunks_exact(PASS_STRIDE)
        .map(|pixel| pixel[AUX + 3])
        .collect()
}

fn clean() -> Vec<u32> {
    pixel_words([4.0; 4], [4.0, 4.0, 4.0], false, 4)
}

fn noisy(converged: bool) -> Vec<u32> {
    pixel_words([4.0; 4], [8.0, 0.0, 4.0], converged, 4)
}

#[test]
fn unconverged_pixels_are_counted_and_spread() {
    let mut integrator = integrator(IntegratorConfig::default(), false, 4, 1);
    write_film(&mut integrator, &[clean(), clean(), noisy(false), clean()]);

    let active = integrator
        .adaptive_sampling_converge_filter_count_active(0.01, false)
        .unwrap();
    assert_eq!(active, 1);
    assert_eq!(converged_flags(&mut integrator), vec![1.0, 0.0, 0.0, 0.0]);
    assert_eq!(integrator.queue().launch_count(DeviceKernel::AdaptiveSamplingFilterX), 1);
    assert_eq!(integrator.queue().launch_count(DeviceKernel::AdaptiveSamplingFilterY), 1);
}

#[test]
fn converged_pixels_are_skipped_unless_reset() {
    let mut integrator = integrator(IntegratorConfig::default(), false, 4, 1);
    write_film(&mut integrator, &[noisy(true), clean(), noisy(false), clean()]);

    let active = integrator
        .adaptive_sampling_converge_filter_count_active(0.01, false)
        .unwrap();
    assert_eq!(active, 1);

    let active = integrator
        .adaptive_sampling_converge_filter_count_active(0.01, true)
        .unwrap();
    assert_eq!(active, 2);
}

#[test]
fn fully_converged_film_skips_the_filters() {
    let mut integrator = integrator(IntegratorConfig::default(), false, 3, 2);
    write_film(&mut integrator, &vec![clean(); 6]);

    let active = integrator
        .adaptive_sampling_converge_filter_count_active(0.01, false)
        .unwrap();
    assert_eq!(active, 0);
    assert_eq!(converged_flags(&mut integrator), vec![1.0; 6]);
    assert_eq!(integrator.queue().launch_count(DeviceKernel::AdaptiveSamplingConvergenceCheck), 1);
    assert_eq!(integrator.queue().launch_count(DeviceKernel::AdaptiveSamplingFilterX), 0);
    assert_eq!(integrator.queue().launch_count(DeviceKernel::AdaptiveSamplingFilterY), 0);
}

#[test]
fn vertical_filter_spreads_along_columns() {
    let mut integrator = integrator(IntegratorConfig::default(), false, 1, 4);
    write_film(&mut integrator, &[clean(), clean(), clean(), noisy(false)]);

    let active = integrator
        .adaptive_sampling_converge_filter_count_active(0.01, false)
        .unwrap();
    assert_eq!(active, 1);
    assert_eq!(converged_flags(&mut integrator), vec![1.0, 1.0, 0.0, 0.0]);
}

#[test]
fn convergence_needs_buffers() {
    let device = HostDevice::new(SyntheticKernels::new(1, 1), HostDeviceConfig::default());
    let scene = SceneInfo {
        max_shaders: 1,
        has_shadow_catcher: false,
        bake_mode: false,
    };
    let mut integrator = WavefrontIntegrator::new(device, IntegratorConfig::default(), scene).unwrap();
    assert!(integrator
        .adaptive_sampling_converge_filter_count_active(0.01, false)
        .is_err());
}

/// Display that optionally exposes a device buffer for direct writes
#[derive(Default)]
struct RecordingDisplay {
    interop: bool,
    mapped: Option<DevicePtr>,
    maps: usize,
    unmaps: usize,
    uploads: Vec<(Vec<[f16; 4]>, u32, u32)>,
}

impl GpuDisplay for RecordingDisplay {
    fn map_device_buffer(
        &mut self,
        queue: &mut dyn DeviceQueue,
        width: u32,
        height: u32,
    ) -> RenderResult<Option<DevicePtr>> {
        self.maps += 1;
        if !self.interop {
            return Ok(None);
        }
        if self.mapped.is_none() {
            let bytes = width as usize * height as usize * 8;
            self.mapped = Some(queue.alloc("display_texture", bytes)?);
        }
        Ok(self.mapped)
    }

    fn unmap_device_buffer(&mut self, _queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.unmaps += 1;
        Ok(())
    }

    fn copy_pixels_to_texture(
        &mut self,
        pixels: &[[f16; 4]],
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        self.uploads.push((pixels.to_vec(), width, height));
        Ok(())
    }
}

fn bright_film(integrator: &mut HostIntegrator) {
    write_film(
        integrator,
        &[
            pixel_words([2.0, 4.0, 6.0, 8.0], [0.0; 3], false, 2),
            pixel_words([1.0, 0.0, 0.5, 2.0], [0.0; 3], false, 2),
        ],
    );
}

fn to_f32(pixel: [f16; 4]) -> [f32; 4] {
    pixel.map(f16::to_f32)
}

#[test]
fn naive_update_uploads_scaled_pixels() {
    let config = IntegratorConfig {
        display_update: DisplayUpdateMode::Naive,
        exposure: 2.0,
        ..Default::default()
    };
    let mut integrator = integrator(config, true, 2, 1);
    bright_film(&mut integrator);

    let mut display = RecordingDisplay {
        interop: true,
        ..Default::default()
    };
    integrator.copy_to_gpu_display(&mut display, 4).unwrap();

    assert_eq!(integrator.display_strategy(), Some(DisplayStrategy::Naive));
    assert_eq!(display.maps, 0);
    assert_eq!(display.uploads.len(), 1);
    let (pixels, width, height) = &display.uploads[0];
    assert_eq!((*width, *height), (2, 1));
    assert_eq!(to_f32(pixels[0]), [1.0, 2.0, 3.0, 4.0]);
    assert_eq!(to_f32(pixels[1]), [0.5, 0.0, 0.25, 1.0]);
}

#[test]
fn auto_mode_writes_through_interop() {
    let mut integrator = integrator(IntegratorConfig::default(), true, 2, 1);
    bright_film(&mut integrator);

    let mut display = RecordingDisplay {
        interop: true,
        ..Default::default()
    };
    integrator.copy_to_gpu_display(&mut display, 2).unwrap();
    integrator.copy_to_gpu_display(&mut display, 2).unwrap();

    assert_eq!(integrator.display_strategy(), Some(DisplayStrategy::Interop));
    assert_eq!((display.maps, display.unmaps), (2, 2));
    assert!(display.uploads.is_empty());

    let texture = integrator.queue().read_words(display.mapped.unwrap()).unwrap();
    let red = f16::from_bits(texture[0] as u16).to_f32();
    let alpha = f16::from_bits((texture[1] >> 16) as u16).to_f32();
    assert_eq!((red, alpha), (1.0, 4.0));
}

#[test]
fn unmappable_display_falls_back_to_naive_for_good() {
    let mut integrator = integrator(IntegratorConfig::default(), true, 2, 1);
    bright_film(&mut integrator);

    let mut display = RecordingDisplay::default();
    integrator.copy_to_gpu_display(&mut display, 2).unwrap();
    assert_eq!(integrator.display_strategy(), Some(DisplayStrategy::Naive));
    assert_eq!(display.maps, 1);
    assert_eq!(display.uploads.len(), 1);
    assert_eq!(to_f32(display.uploads[0].0[0]), [1.0, 2.0, 3.0, 4.0]);

    integrator.copy_to_gpu_display(&mut display, 2).unwrap();
    assert_eq!(display.maps, 1);
    assert_eq!(display.uploads.len(), 2);
}

#[test]
fn auto_mode_without_interop_reads_back() {
    let mut integrator = integrator(IntegratorConfig::default(), false, 2, 1);
    bright_film(&mut integrator);

    let mut display = RecordingDisplay {
        interop: true,
        ..Default::default()
    };
    integrator.copy_to_gpu_display(&mut display, 2).unwrap();
    assert_eq!(integrator.display_strategy(), Some(DisplayStrategy::Naive));
    assert_eq!(display.maps, 0);
    assert_eq!(display.uploads.len(), 1);
}

#[test]
fn display_update_without_buffers_is_a_no_op() {
    let device = HostDevice::new(SyntheticKernels::new(1, 1), HostDeviceConfig::default());
    let scene = SceneInfo {
        max_shaders: 1,
        has_shadow_catcher: false,
        bake_mode: false,
    };
    let mut integrator = WavefrontIntegrator::new(device, IntegratorConfig::default(), scene).unwrap();
    let mut display = RecordingDisplay::default();
    integrator.copy_to_gpu_display(&mut display, 1).unwrap();
    assert!(display.uploads.is_empty());
    assert_eq!(integrator.display_strategy(), None);
}
