use std::fmt;
use std::mem;
use std::slice;
use std::sync::Arc;

use log::error;

use super::Transport;
use crate::Error;

/// A DMA-coherent buffer mapped into this process.
///
/// Only memory obtained this way may be handed to a transfer. The mapping is
/// released, and the memory freed, when the buffer is dropped.
pub struct DmaBuffer<T: Transport> {
    transport: Arc<T>,
    size: usize,
    buffer: *mut libc::c_void,
}

impl<T: Transport> fmt::Debug for DmaBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DmaBuffer")?;
        writeln!(f, "  size: {:#x?}", &self.size)?;
        write!(f, "  buffer: {:?}", &self.buffer)
    }
}

impl<T: Transport> DmaBuffer<T> {
    pub(crate) fn new(transport: Arc<T>, size: usize) -> Result<DmaBuffer<T>, Error> {
        let addr = transport.mmap(size)?;
        Ok(DmaBuffer {
            transport,
            size,
            buffer: addr as *mut libc::c_void,
        })
    }

    #[allow(clippy::mut_from_ref)]
    pub fn slice<U>(&self) -> &mut [U] {
        unsafe { slice::from_raw_parts_mut(self.buffer as *mut U, self.size / mem::size_of::<U>()) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn buffer(&self) -> *mut libc::c_void {
        self.buffer
    }

    /// Address of the mapping, as passed to the driver.
    pub fn addr(&self) -> usize {
        self.buffer as usize
    }
}

impl<T: Transport> Drop for DmaBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.transport.munmap(self.addr(), self.size) {
            error!("failed to free the DMA memory mapped region: {}", e);
        }
    }
}

unsafe impl<T: Transport> Send for DmaBuffer<T> {}
unsafe impl<T: Transport> Sync for DmaBuffer<T> {}
