// src/path_tracing/wavefront/state.rs
// Structure-of-arrays storage for in-flight path states
// One device array per schema field, indexed by state slot; the descriptor of array pointers is uploaded once

use bytemuck::{Pod, Zeroable};

use crate::device::{DeviceKernel, DevicePtr, DeviceQueue, NUM_INTEGRATOR_KERNELS};
use crate::error::{RenderError, RenderResult};

/// Constant-memory block name of the state descriptor
pub const INTEGRATOR_STATE_CONSTANT: &str = "integrator_state";

/// One member of the path state schema.
///
/// Every element is a whole number of 32-bit words so kernels can move states
/// field by field without knowing the member types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateField {
    PathQueuedKernel = 0,
    PathShaderSortKey,
    PathRenderPixelIndex,
    PathSample,
    PathBounce,
    PathFlag,
    PathRngHash,
    PathThroughput,
    RayOrigin,
    RayDirection,
    RayTmax,
    IsectT,
    IsectPrim,
    IsectObject,
    IsectType,
    IsectUv,
    ShadowPathQueuedKernel,
    ShadowRayOrigin,
    ShadowRayDirection,
    ShadowRayTmax,
    ShadowPathThroughput,
}

pub const NUM_STATE_FIELDS: usize = StateField::ShadowPathThroughput as usize + 1;

impl StateField {
    /// Schema in descriptor order
    pub const ALL: [StateField; NUM_STATE_FIELDS] = [
        StateField::PathQueuedKernel,
        StateField::PathShaderSortKey,
        StateField::PathRenderPixelIndex,
        StateField::PathSample,
        StateField::PathBounce,
        StateField::PathFlag,
        StateField::PathRngHash,
        StateField::PathThroughput,
        StateField::RayOrigin,
        StateField::RayDirection,
        StateField::RayTmax,
        StateField::IsectT,
        StateField::IsectPrim,
        StateField::IsectObject,
        StateField::IsectType,
        StateField::IsectUv,
        StateField::ShadowPathQueuedKernel,
        StateField::ShadowRayOrigin,
        StateField::ShadowRayDirection,
        StateField::ShadowRayTmax,
        StateField::ShadowPathThroughput,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StateField::PathQueuedKernel => "path.queued_kernel",
            StateField::PathShaderSortKey => "path.shader_sort_key",
            StateField::PathRenderPixelIndex => "path.render_pixel_index",
            StateField::PathSample => "path.sample",
            StateField::PathBounce => "path.bounce",
            StateField::PathFlag => "path.flag",
            StateField::PathRngHash => "path.rng_hash",
            StateField::PathThroughput => "path.throughput",
            StateField::RayOrigin => "ray.P",
            StateField::RayDirection => "ray.D",
            StateField::RayTmax => "ray.tmax",
            StateField::IsectT => "isect.t",
            StateField::IsectPrim => "isect.prim",
            StateField::IsectObject => "isect.object",
            StateField::IsectType => "isect.type",
            StateField::IsectUv => "isect.uv",
            StateField::ShadowPathQueuedKernel => "shadow_path.queued_kernel",
            StateField::ShadowRayOrigin => "shadow_ray.P",
            StateField::ShadowRayDirection => "shadow_ray.D",
            StateField::ShadowRayTmax => "shadow_ray.tmax",
            StateField::ShadowPathThroughput => "shadow_path.throughput",
        }
    }

    /// Element size in 32-bit words
    pub fn words(self) -> usize {
        match self {
            StateField::PathThroughput
            | StateField::RayOrigin
            | StateField::RayDirection
            | StateField::ShadowRayOrigin
            | StateField::ShadowRayDirection
            | StateField::ShadowPathThroughput => 3,
            StateField::IsectUv => 2,
            _ => 1,
        }
    }

    pub fn elem_size(self) -> usize {
        self.words() * std::mem::size_of::<u32>()
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Bytes of device memory one path state occupies
pub fn integrator_state_size() -> usize {
    StateField::ALL.iter().map(|field| field.elem_size()).sum()
}

/// Device pointers of every state array plus the shared counters, as kernels see them
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct IntegratorStateGpu {
    pub fields: [DevicePtr; NUM_STATE_FIELDS],
    pub queue_counter: DevicePtr,
    pub sort_key_counter: [DevicePtr; NUM_INTEGRATOR_KERNELS],
    pub capacity: u32,
}

impl IntegratorStateGpu {
    pub fn field(&self, field: StateField) -> DevicePtr {
        self.fields[field.index()]
    }

    pub fn sort_key_counter(&self, kernel: DeviceKernel) -> DevicePtr {
        kernel
            .integrator_index()
            .map(|index| self.sort_key_counter[index])
            .unwrap_or(DevicePtr::NULL)
    }

    /// Decode the descriptor from its constant-memory bytes
    pub fn from_bytes(bytes: &[u8]) -> RenderResult<Self> {
        bytemuck::try_pod_read_unaligned(bytes).map_err(|err| {
            RenderError::upload(format!("malformed integrator state descriptor: {err:?}"))
        })
    }
}

/// Fixed-capacity path state storage, allocated once and reused for every pass
pub struct IntegratorStateArena {
    capacity: usize,
    descriptor: IntegratorStateGpu,
    descriptor_uploaded: bool,
}

impl Default for IntegratorStateArena {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegratorStateArena {
    pub fn new() -> Self {
        Self {
            capacity: 0,
            descriptor: IntegratorStateGpu::zeroed(),
            descriptor_uploaded: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_allocated(&self) -> bool {
        self.capacity != 0
    }

    pub fn descriptor(&self) -> &IntegratorStateGpu {
        &self.descriptor
    }

    pub fn field_ptr(&self, field: StateField) -> DevicePtr {
        self.descriptor.field(field)
    }

    /// Allocate one device array per schema field. No-op once allocated.
    pub fn alloc(&mut self, queue: &mut dyn DeviceQueue, capacity: usize) -> RenderResult<()> {
        if self.is_allocated() {
            return Ok(());
        }
        if capacity == 0 {
            return Err(RenderError::device("device reports zero concurrent path states"));
        }
        let capacity_u32 = u32::try_from(capacity)
            .map_err(|_| RenderError::config(format!("path state capacity {capacity} exceeds u32")))?;

        for field in StateField::ALL {
            let ptr = queue.alloc(field.name(), field.elem_size() * capacity)?;
            self.descriptor.fields[field.index()] = ptr;
        }
        self.descriptor.capacity = capacity_u32;
        self.capacity = capacity;

        log::info!(
            "Allocated {} path states ({} bytes each, {} arrays)",
            capacity,
            integrator_state_size(),
            NUM_STATE_FIELDS
        );
        Ok(())
    }

    pub fn link_queue_counter(&mut self, ptr: DevicePtr) {
        self.descriptor.queue_counter = ptr;
    }

    pub fn link_sort_key_counter(&mut self, kernel: DeviceKernel, ptr: DevicePtr) {
        if let Some(index) = kernel.integrator_index() {
            self.descriptor.sort_key_counter[index] = ptr;
        }
    }

    /// Upload the descriptor to constant memory. Later calls are no-ops.
    pub fn upload_descriptor(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        if self.descriptor_uploaded {
            return Ok(());
        }
        queue.const_copy_to(INTEGRATOR_STATE_CONSTANT, bytemuck::bytes_of(&self.descriptor))?;
        self.descriptor_uploaded = true;
        Ok(())
    }
}
