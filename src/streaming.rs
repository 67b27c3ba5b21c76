//! Streaming buffer (component H): a bump-allocator discipline layered on
//! a single [`Buffer`] for short-lived, per-draw uploads.

use std::sync::Arc;

use crate::backend::Backend;
use crate::buffer::{AccessFlags, BindFlags, Buffer, BufferDesc, BufferUsage};
use crate::config;
use crate::error::{CreationError, MapError};
use crate::mapping::{self, MapBox, MapFlags};

/// A device-accessible, dynamic, write-only buffer with a bump cursor.
pub struct StreamingBuffer {
    bind_flags: BindFlags,
    backend_factory: Arc<dyn Fn(u64) -> Arc<dyn Backend>>,
    buffer: Buffer,
    cursor: u64,
    capacity: u64,
}

impl StreamingBuffer {
    /// Create a streaming buffer of at least [`config::SB_MIN_SIZE`] bytes.
    /// `backend_factory` builds a fresh [`Backend`] of a requested size
    /// whenever the buffer must grow, mirroring the source's
    /// create-new/drop-old reallocation on overflow.
    pub fn new(
        bind_flags: BindFlags,
        backend_factory: Arc<dyn Fn(u64) -> Arc<dyn Backend>>,
    ) -> Result<Self, CreationError> {
        let capacity = config::SB_MIN_SIZE;
        let backend = backend_factory(capacity);
        let buffer = Buffer::create(
            BufferDesc {
                byte_width: capacity,
                usage: BufferUsage::DYNAMIC,
                bind_flags,
                access: AccessFlags::MAP_WRITE | AccessFlags::GPU,
                structure_byte_stride: 0,
            },
            backend,
            Some(&vec![0u8; capacity as usize]),
        )?;
        Ok(StreamingBuffer { bind_flags, backend_factory, buffer, cursor: 0, capacity })
    }

    /// The buffer bytes are currently housed in.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// `prepare(min_size)`: grow if the current capacity can't satisfy
    /// `min_size`, resetting the cursor; otherwise a no-op.
    pub fn prepare(&mut self, min_size: u64) -> Result<(), CreationError> {
        if self.capacity >= min_size {
            return Ok(());
        }
        let new_capacity = config::SB_MIN_SIZE.max((2 * self.capacity).max(min_size));
        let backend = (self.backend_factory)(new_capacity);
        let buffer = Buffer::create(
            BufferDesc {
                byte_width: new_capacity,
                usage: BufferUsage::DYNAMIC,
                bind_flags: self.bind_flags,
                access: AccessFlags::MAP_WRITE | AccessFlags::GPU,
                structure_byte_stride: 0,
            },
            backend,
            Some(&vec![0u8; new_capacity as usize]),
        )?;
        self.buffer = buffer;
        self.capacity = new_capacity;
        self.cursor = 0;
        Ok(())
    }

    /// `map(size, stride, out_pos, out_ptr)`: align the cursor to `stride`,
    /// wrap to 0 with `DISCARD` on overflow, otherwise `NOOVERWRITE`.
    /// Returns `(pos, ptr)`.
    pub fn map(&mut self, size: u64, stride: u64) -> Result<(u64, std::ptr::NonNull<u8>), MapError> {
        self.prepare(size).map_err(|_| MapError::OutOfMemory)?;

        let stride = stride.max(1);
        let aligned = (self.cursor + stride - 1) / stride * stride;
        let wraps = aligned + size > self.capacity;
        let pos = if wraps { 0 } else { aligned };
        // A position of 0 always renames storage: either the buffer was
        // just allocated or the cursor just wrapped past bytes the GPU may
        // still be reading.
        let flags = if pos == 0 { MapFlags::WRITE | MapFlags::DISCARD } else { MapFlags::WRITE | MapFlags::NOOVERWRITE };

        let ptr = mapping::map(&mut self.buffer, 0, MapBox { left: pos, right: pos + size }, flags)?;
        self.cursor = pos + size;
        Ok((pos, ptr))
    }

    /// Unmap the underlying buffer.
    pub fn unmap(&mut self) -> Result<(), MapError> {
        mapping::unmap(&mut self.buffer, 0)
    }

    /// `upload(data, size, stride)`: map, copy, unmap.
    pub fn upload(&mut self, data: &[u8], stride: u64) -> Result<u64, MapError> {
        let size = data.len() as u64;
        let (pos, ptr) = self.map(size, stride)?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
        self.unmap()?;
        Ok(pos)
    }
}
