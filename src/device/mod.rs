// src/device/mod.rs
// Compute queue abstraction consumed by the wavefront scheduler
// Backends: host reference device (CPU) and wgpu compute (GPU)

pub mod host;
pub mod kernel;
pub mod memory;
pub mod synthetic;
pub mod wgpu_backend;

pub use kernel::{DeviceKernel, NUM_INTEGRATOR_KERNELS, QUEUE_TAG_NONE};
pub use memory::DeviceVector;

use bytemuck::{Pod, Zeroable};

use crate::error::{RenderError, RenderResult};

/// Opaque handle to a device allocation. Zero is the null pointer.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DevicePtr(pub u32);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// One launch argument
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    Int(i32),
    Float(f32),
}

impl KernelArg {
    /// 32-bit word a shader sees for this argument, with pointers translated by `resolve`
    pub fn as_word(self, resolve: impl Fn(DevicePtr) -> u32) -> u32 {
        match self {
            KernelArg::Ptr(ptr) => resolve(ptr),
            KernelArg::Int(value) => value as u32,
            KernelArg::Float(value) => value.to_bits(),
        }
    }
}

/// Ordered launch arguments for [`DeviceQueue::enqueue`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KernelArgs {
    args: Vec<KernelArg>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ptr(mut self, ptr: DevicePtr) -> Self {
        self.args.push(KernelArg::Ptr(ptr));
        self
    }

    pub fn int(mut self, value: i32) -> Self {
        self.args.push(KernelArg::Int(value));
        self
    }

    /// Counts and sizes are stored as device ints
    pub fn size(self, value: usize) -> Self {
        self.int(value as i32)
    }

    pub fn float(mut self, value: f32) -> Self {
        self.args.push(KernelArg::Float(value));
        self
    }

    pub fn flag(self, value: bool) -> Self {
        self.int(i32::from(value))
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernelArg> {
        self.args.iter()
    }

    pub fn get_ptr(&self, index: usize) -> RenderResult<DevicePtr> {
        match self.args.get(index) {
            Some(KernelArg::Ptr(ptr)) => Ok(*ptr),
            other => Err(RenderError::render(format!(
                "kernel argument {index} is not a pointer: {other:?}"
            ))),
        }
    }

    pub fn get_int(&self, index: usize) -> RenderResult<i32> {
        match self.args.get(index) {
            Some(KernelArg::Int(value)) => Ok(*value),
            other => Err(RenderError::render(format!(
                "kernel argument {index} is not an int: {other:?}"
            ))),
        }
    }

    /// Non-negative int argument as a size
    pub fn get_size(&self, index: usize) -> RenderResult<usize> {
        let value = self.get_int(index)?;
        usize::try_from(value).map_err(|_| {
            RenderError::render(format!("kernel argument {index} is negative: {value}"))
        })
    }

    pub fn get_float(&self, index: usize) -> RenderResult<f32> {
        match self.args.get(index) {
            Some(KernelArg::Float(value)) => Ok(*value),
            other => Err(RenderError::render(format!(
                "kernel argument {index} is not a float: {other:?}"
            ))),
        }
    }

    /// Parameter words in argument order, as shaders read them
    pub fn param_words(&self, resolve: impl Fn(DevicePtr) -> u32) -> Vec<u32> {
        self.args.iter().map(|arg| arg.as_word(&resolve)).collect()
    }
}

/// The compute queue a render pass submits into.
///
/// `enqueue`, `zero_to_device` and `copy_to_device` are non-blocking submissions
/// executed in issue order. `copy_from_device` and `synchronize` are the only
/// blocking points.
pub trait DeviceQueue {
    /// Prepare the queue for a sequence of launches (pipelines, scratch)
    fn init_execution(&mut self) -> RenderResult<()>;

    /// Allocate `size` bytes of zero-initialized device memory
    fn alloc(&mut self, label: &str, size: usize) -> RenderResult<DevicePtr>;

    /// Size in bytes of an allocation
    fn mem_size(&self, ptr: DevicePtr) -> RenderResult<usize>;

    /// Upload a named constant-memory block
    fn const_copy_to(&mut self, name: &str, data: &[u8]) -> RenderResult<()>;

    fn enqueue(
        &mut self,
        kernel: DeviceKernel,
        work_size: usize,
        args: &KernelArgs,
    ) -> RenderResult<()>;

    fn zero_to_device(&mut self, ptr: DevicePtr) -> RenderResult<()>;

    fn copy_to_device(&mut self, ptr: DevicePtr, data: &[u8]) -> RenderResult<()>;

    /// Read `data.len()` bytes back from the start of the allocation
    fn copy_from_device(&mut self, ptr: DevicePtr, data: &mut [u8]) -> RenderResult<()>;

    /// Wait for all submitted work. `false` means the device failed.
    fn synchronize(&mut self) -> bool;

    /// How many path states of `state_size` bytes the device keeps in flight
    fn num_concurrent_states(&self, state_size: usize) -> usize;

    /// Active path count below which new work should be admitted
    fn num_concurrent_busy_states(&self) -> usize;

    /// Whether display updates can write straight into a mapped display buffer
    fn should_use_graphics_interop(&self) -> bool {
        false
    }
}

/// Synchronize and turn a device failure into a fatal error
pub fn synchronize_or_fail(queue: &mut dyn DeviceQueue, context: &str) -> RenderResult<()> {
    if queue.synchronize() {
        Ok(())
    } else {
        log::error!("Device synchronization failed after {context}");
        Err(RenderError::device(format!(
            "synchronization failed after {context}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_translate_pointers_into_words() {
        let args = KernelArgs::new()
            .ptr(DevicePtr(3))
            .ptr(DevicePtr::NULL)
            .size(17)
            .float(0.5);
        assert_eq!(args.len(), 4);
        let words = args.param_words(|ptr| if ptr.is_null() { u32::MAX } else { ptr.0 * 10 });
        assert_eq!(words, vec![30, u32::MAX, 17, 0.5f32.to_bits()]);
        assert_eq!(args.get_size(2).unwrap(), 17);
        assert!(args.get_int(0).is_err());
        assert!(args.get_ptr(1).unwrap().is_null());
    }
}
