//! Map/unmap protocol (component F): reference-counted mapping with
//! DISCARD/NOOVERWRITE/WRITE semantics and first-map alignment fallback.

use std::ptr::NonNull;

use crate::buffer::{Buffer, BufferUsage};
use crate::config;
use crate::error::MapError;
use crate::location::Locations;

bitflags! {
    /// Flags recognized by [`map`].
    pub struct MapFlags: u8 {
        const READ         = 0x1;
        const WRITE        = 0x2;
        const DISCARD      = 0x4;
        const NOOVERWRITE  = 0x8;
    }
}

/// A sub-range of a buffer to map, `[left, right)`.
#[derive(Clone, Copy, Debug)]
pub struct MapBox {
    pub left: u64,
    pub right: u64,
}

fn sysmem_fast_path(buffer: &Buffer, flags: MapFlags) -> bool {
    let write_no_rename = flags.contains(MapFlags::WRITE) && !flags.intersects(MapFlags::DISCARD | MapFlags::NOOVERWRITE);
    let read_already_resident = !flags.contains(MapFlags::WRITE) && buffer.locations().contains(Locations::SYSMEM);
    write_no_rename || read_already_resident || buffer.pin_sysmem() || !buffer.use_bo()
}

/// `map(sub_index, box, flags) -> ptr` (spec.md §4.F).
pub fn map(buffer: &mut Buffer, sub_index: u32, region: MapBox, flags: MapFlags) -> Result<NonNull<u8>, MapError> {
    if sub_index != 0 {
        return Err(MapError::InvalidSubresource);
    }

    let first_map = buffer.map_count() == 0;
    // spec.md §4.F: "the first map wins" — a concurrent mapper's own flags
    // never redirect an already-active mapping to the other residency.
    let via_bo = if first_map {
        let decision = !sysmem_fast_path(buffer, flags);
        buffer.set_locked_via_bo(Some(decision));
        decision
    } else {
        buffer.locked_via_bo().unwrap_or_else(|| !sysmem_fast_path(buffer, flags))
    };

    if !via_bo {
        buffer
            .load_location(Locations::SYSMEM)
            .map_err(|_| MapError::OutOfMemory)?;
        if flags.contains(MapFlags::WRITE) {
            let affected = if flags.contains(MapFlags::DISCARD) { MapBox { left: 0, right: 0 } } else { region };
            invalidate_others(buffer, Locations::SYSMEM, affected);
        }
    } else {
        if flags.contains(MapFlags::DISCARD) {
            if !buffer.backend().prepare(Locations::BUFFER) {
                return Err(MapError::OutOfMemory);
            }
            buffer.ensure_bo_registered();
            let dirty = buffer.dirty_mut();
            dirty.clear();
            *buffer.locations_mut() = Locations::BUFFER;
        } else {
            buffer
                .load_location(Locations::BUFFER)
                .map_err(|_| MapError::OutOfMemory)?;
        }
        if flags.contains(MapFlags::WRITE) {
            invalidate_others(buffer, Locations::BUFFER, region);
        }
    }

    if first_map {
        if via_bo {
            match buffer.backend().map() {
                Ok(ptr) => {
                    if (ptr.as_ptr() as usize) % config::RESOURCE_ALIGNMENT != 0 {
                        buffer.backend().unmap();
                        recover_from_misalignment(buffer)?;
                    } else {
                        buffer.set_map_ptr(Some(ptr));
                        buffer.set_mapped_via_bo(true);
                    }
                }
                Err(_) => return Err(MapError::OutOfMemory),
            }
        }
    }

    *buffer.map_count_mut() += 1;

    let base = base_ptr(buffer)?;
    let offset = region.left as usize;
    // Safety: `offset` is bounded by the buffer's byte width by caller
    // contract; `base` points at least that many bytes of valid storage.
    Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) })
}

fn invalidate_others(buffer: &mut Buffer, keep: Locations, region: MapBox) {
    let (offset, size) = (region.left, region.right - region.left);
    for loc in [Locations::SYSMEM, Locations::BUFFER] {
        if loc != keep {
            buffer.invalidate_range(loc, offset, size);
        }
    }
}

fn recover_from_misalignment(buffer: &mut Buffer) -> Result<(), MapError> {
    buffer.set_mapped_via_bo(false);
    // Recovery always lands on sysmem, so the locked decision for this
    // mapping's remaining concurrent mappers must follow it.
    buffer.set_locked_via_bo(Some(false));
    if buffer.desc().usage.contains(BufferUsage::DYNAMIC) {
        buffer.set_use_bo(false);
    } else {
        buffer.set_pin_sysmem(true);
    }
    buffer.load_location(Locations::SYSMEM).map_err(|_| MapError::OutOfMemory)
}

fn base_ptr(buffer: &mut Buffer) -> Result<NonNull<u8>, MapError> {
    if buffer.mapped_via_bo() {
        return buffer.map_ptr().ok_or(MapError::OutOfMemory);
    }
    let mem = buffer.ensure_host_mem_pub();
    NonNull::new(mem.as_mut_ptr()).ok_or(MapError::OutOfMemory)
}

/// `unmap(sub_index)`: flush only once the refcount reaches zero.
pub fn unmap(buffer: &mut Buffer, sub_index: u32) -> Result<(), MapError> {
    if sub_index != 0 {
        return Err(MapError::InvalidSubresource);
    }
    if buffer.map_count() == 0 {
        log::debug!("unmap with no matching map on buffer {:?}", buffer.id());
        return Ok(());
    }
    *buffer.map_count_mut() -= 1;
    if buffer.map_count() > 0 {
        return Ok(());
    }

    if buffer.mapped_via_bo() {
        flush_dirty_to_backend(buffer);
        buffer.backend().unmap();
    }
    buffer.set_map_ptr(None);
    buffer.set_mapped_via_bo(false);
    buffer.set_locked_via_bo(None);
    Ok(())
}

fn flush_dirty_to_backend(buffer: &mut Buffer) {
    let ranges: Vec<_> = buffer.dirty().iter().copied().collect();
    if ranges.is_empty() {
        return;
    }
    let whole = buffer.dirty().fully_dirty();
    if let Some(mem) = buffer.host_mem_mut() {
        let mem = mem.clone();
        for range in ranges {
            let start = range.offset as usize;
            let end = range.end() as usize;
            buffer.backend().upload(range.offset, &mem[start..end], whole);
        }
    }
    buffer.dirty_mut().clear();
}
