// src/device/memory.rs
// Typed device allocation with a host-side mirror
// Host data is only meaningful after an explicit copy in either direction

use bytemuck::Pod;

use super::{DevicePtr, DeviceQueue};
use crate::error::{RenderError, RenderResult};

/// Device array of `T` paired with a host copy of the same length
pub struct DeviceVector<T: Pod> {
    label: &'static str,
    device_pointer: DevicePtr,
    host: Vec<T>,
}

impl<T: Pod> DeviceVector<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            device_pointer: DevicePtr::NULL,
            host: Vec::new(),
        }
    }

    /// Allocate room for `len` elements, dropping any previous allocation
    pub fn alloc(&mut self, queue: &mut dyn DeviceQueue, len: usize) -> RenderResult<()> {
        let bytes = len.max(1) * std::mem::size_of::<T>();
        self.device_pointer = queue.alloc(self.label, bytes)?;
        self.host = vec![T::zeroed(); len];
        Ok(())
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn device_pointer(&self) -> DevicePtr {
        self.device_pointer
    }

    pub fn is_allocated(&self) -> bool {
        !self.device_pointer.is_null()
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.host
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.host
    }

    /// Zero device memory. The host mirror is left untouched.
    pub fn zero_to_device(&self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.check_allocated()?;
        queue.zero_to_device(self.device_pointer)
    }

    /// Zero both device memory and the host mirror, without a round trip
    pub fn zero_both(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.zero_to_device(queue)?;
        self.host.fill(T::zeroed());
        Ok(())
    }

    pub fn copy_to_device(&self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.check_allocated()?;
        queue.copy_to_device(self.device_pointer, bytemuck::cast_slice(&self.host))
    }

    pub fn copy_from_device(&mut self, queue: &mut dyn DeviceQueue) -> RenderResult<()> {
        self.check_allocated()?;
        queue.copy_from_device(
            self.device_pointer,
            bytemuck::cast_slice_mut(&mut self.host),
        )
    }

    fn check_allocated(&self) -> RenderResult<()> {
        if self.is_allocated() {
            Ok(())
        } else {
            Err(RenderError::upload(format!(
                "device vector '{}' used before allocation",
                self.label
            )))
        }
    }
}
