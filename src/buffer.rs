//! Buffer object and the migration routine (component D).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::Backend;
use crate::config;
use crate::conversion::{self, convert_range, ConversionMap, StreamState};
use crate::error::{CreationError, LoadError};
use crate::location::{CoherenceViolation, Locations};
use crate::range::RangeSet;
use crate::BufferId;

bitflags! {
    /// Creation-time usage bits.
    pub struct BufferUsage: u32 {
        /// Content is expected to be rewritten frequently by the CPU.
        const DYNAMIC    = 0x1;
        /// The vertex declaration is fixed for the buffer's lifetime, so
        /// declaration inspection need only run once ([`Buffer::HASDESC`]).
        const STATICDECL = 0x2;
        /// Managed residency: the buffer is host-pinned (`pin_sysmem`).
        const MANAGED    = 0x4;
    }
}

bitflags! {
    /// Binding points this buffer may be attached to.
    pub struct BindFlags: u32 {
        const VERTEX            = 0x001;
        const INDEX             = 0x002;
        const CONSTANT          = 0x004;
        const SHADER_RESOURCE   = 0x008;
        const UNORDERED_ACCESS  = 0x010;
        const STREAM_OUTPUT     = 0x020;
        const INDIRECT          = 0x040;
        const RENDER_TARGET     = 0x080;
        const DEPTH_STENCIL     = 0x100;
    }
}

bitflags! {
    /// CPU/GPU access bits.
    pub struct AccessFlags: u32 {
        const MAP_READ  = 0x1;
        const MAP_WRITE = 0x2;
        const GPU       = 0x4;
    }
}

/// Immutable creation-time descriptor.
#[derive(Clone, Debug)]
pub struct BufferDesc {
    /// Size of the buffer, in bytes.
    pub byte_width: u64,
    /// Usage bits (`DYNAMIC`, `STATICDECL`, `MANAGED`).
    pub usage: BufferUsage,
    /// Binding points this buffer may be attached to.
    pub bind_flags: BindFlags,
    /// CPU/GPU access bits.
    pub access: AccessFlags,
    /// Stride of a structured-buffer element, in bytes; `0` when not a
    /// structured buffer.
    pub structure_byte_stride: u32,
}

fn next_id() -> BufferId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    BufferId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// The managed resource: host memory, dirty ranges, location state, and
/// the orchestration to migrate between them (spec.md §3–4.D).
impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .field("host_mem", &self.host_mem)
            .field("locations", &self.locations)
            .field("dirty", &self.dirty)
            .field("conversion", &self.conversion)
            .field("stride", &self.stride)
            .field("decl_change_count", &self.decl_change_count)
            .field("full_conversion_count", &self.full_conversion_count)
            .field("draw_count", &self.draw_count)
            .field("has_desc", &self.has_desc)
            .field("use_bo", &self.use_bo)
            .field("map_count", &self.map_count)
            .field("pin_sysmem", &self.pin_sysmem)
            .field("map_ptr", &self.map_ptr)
            .field("mapped_via_bo", &self.mapped_via_bo)
            .field("locked_via_bo", &self.locked_via_bo)
            .finish_non_exhaustive()
    }
}

pub struct Buffer {
    id: BufferId,
    desc: BufferDesc,
    backend: Arc<dyn Backend>,
    host_mem: Option<Vec<u8>>,
    locations: Locations,
    dirty: RangeSet,
    conversion: Option<ConversionMap>,
    stride: u32,
    decl_change_count: u32,
    full_conversion_count: u32,
    draw_count: u32,
    has_desc: bool,
    use_bo: bool,
    map_count: u32,
    pin_sysmem: bool,
    map_ptr: Option<std::ptr::NonNull<u8>>,
    mapped_via_bo: bool,
    locked_via_bo: Option<bool>,
    bo_valid: Option<Arc<AtomicBool>>,
}

/// Where a buffer's authoritative bytes currently live, as reported by
/// [`Buffer::get_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Host memory is authoritative.
    SysMem,
    /// The device buffer object is authoritative.
    Bo,
}

impl Buffer {
    /// Create a buffer per spec.md §6's validation rules.
    ///
    /// A buffer is required to carry initial data when it can never be
    /// written to again after creation (not `DYNAMIC`, no `MAP_WRITE`
    /// access) — the idiomatic stand-in for the source's "data requested
    /// but the pointer is null" check.
    pub fn create(
        desc: BufferDesc,
        backend: Arc<dyn Backend>,
        initial_data: Option<&[u8]>,
    ) -> Result<Buffer, CreationError> {
        if desc.byte_width == 0 {
            return Err(CreationError::ZeroSize);
        }
        if desc.bind_flags.contains(BindFlags::CONSTANT)
            && desc.byte_width % config::CONSTANT_BUFFER_ALIGNMENT != 0
        {
            return Err(CreationError::Misaligned(config::CONSTANT_BUFFER_ALIGNMENT));
        }
        let requires_initial_data =
            !desc.usage.contains(BufferUsage::DYNAMIC) && !desc.access.contains(AccessFlags::MAP_WRITE);
        if requires_initial_data && initial_data.is_none() {
            return Err(CreationError::MissingInitialData);
        }

        let use_bo = desc.access.contains(AccessFlags::GPU);
        let pin_sysmem = desc.usage.contains(BufferUsage::MANAGED);
        let size = desc.byte_width;

        let mut buffer = Buffer {
            id: next_id(),
            desc,
            backend,
            host_mem: None,
            locations: Locations::CLEARED,
            dirty: RangeSet::new(size),
            conversion: None,
            stride: 0,
            decl_change_count: 0,
            full_conversion_count: 0,
            draw_count: 0,
            has_desc: false,
            use_bo,
            map_count: 0,
            pin_sysmem,
            map_ptr: None,
            mapped_via_bo: false,
            locked_via_bo: None,
            bo_valid: None,
        };

        if let Some(data) = initial_data {
            let host = buffer.host_mem.get_or_insert_with(|| vec![0u8; size as usize]);
            let len = data.len().min(host.len());
            host[..len].copy_from_slice(&data[..len]);
            buffer.locations = Locations::SYSMEM;
            // The device BO, if any is ever created, starts out needing the
            // whole buffer copied in from this sysmem copy.
            buffer.invalidate_range(Locations::BUFFER, 0, 0);
        } else if pin_sysmem {
            buffer.host_mem = Some(vec![0u8; size as usize]);
            buffer.locations = Locations::SYSMEM;
            buffer.invalidate_range(Locations::BUFFER, 0, 0);
        }

        log::debug!("created buffer {:?} ({} bytes)", buffer.id, size);
        Ok(buffer)
    }

    /// Debug identifier assigned at creation.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// The immutable creation-time descriptor.
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// The currently-valid location set.
    pub fn locations(&self) -> Locations {
        self.locations
    }

    /// Whether device residency is still permitted for this buffer. Once
    /// the profitability heuristics in [`crate::load`] trip, this becomes
    /// `false` and stays `false` for the buffer's lifetime.
    pub fn use_bo(&self) -> bool {
        self.use_bo
    }

    pub(crate) fn set_use_bo(&mut self, use_bo: bool) {
        self.use_bo = use_bo;
        if !use_bo {
            self.backend.unload(Locations::BUFFER);
            let _ = self.locations.invalidate(Locations::BUFFER, &mut self.dirty);
            self.bo_valid = None;
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn dirty(&self) -> &RangeSet {
        &self.dirty
    }

    pub(crate) fn dirty_mut(&mut self) -> &mut RangeSet {
        &mut self.dirty
    }

    pub(crate) fn conversion(&self) -> Option<&ConversionMap> {
        self.conversion.as_ref()
    }

    pub(crate) fn has_desc(&self) -> bool {
        self.has_desc
    }

    pub(crate) fn map_count(&self) -> u32 {
        self.map_count
    }

    pub(crate) fn map_count_mut(&mut self) -> &mut u32 {
        &mut self.map_count
    }

    pub(crate) fn pin_sysmem(&self) -> bool {
        self.pin_sysmem
    }

    pub(crate) fn set_pin_sysmem(&mut self, pin: bool) {
        self.pin_sysmem = pin;
    }

    pub(crate) fn map_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        self.map_ptr
    }

    pub(crate) fn set_map_ptr(&mut self, ptr: Option<std::ptr::NonNull<u8>>) {
        self.map_ptr = ptr;
    }

    pub(crate) fn mapped_via_bo(&self) -> bool {
        self.mapped_via_bo
    }

    pub(crate) fn set_mapped_via_bo(&mut self, via_bo: bool) {
        self.mapped_via_bo = via_bo;
    }

    /// The residency decision the first concurrent mapper locked in, if a
    /// mapping is currently active. Spec.md §4.F: "the first map wins" —
    /// every subsequent concurrent `map()` call must reuse this rather than
    /// re-deriving it from its own flags.
    pub(crate) fn locked_via_bo(&self) -> Option<bool> {
        self.locked_via_bo
    }

    pub(crate) fn set_locked_via_bo(&mut self, via_bo: Option<bool>) {
        self.locked_via_bo = via_bo;
    }

    /// Register this buffer as a user of the backend's current device
    /// buffer object, if it has not already registered one (spec.md §9
    /// "Weak BO-user link"). Idempotent for the lifetime of a given BO.
    pub(crate) fn ensure_bo_registered(&mut self) {
        if self.bo_valid.is_none() {
            self.bo_valid = Some(self.backend.register_user());
        }
    }

    /// Consult the registered validity flag and drop `BUFFER` locally if
    /// the backend tore down the device object behind this buffer's back
    /// (e.g. via [`Self::set_use_bo`] on a sibling, or backend-driven
    /// eviction). Must run before any code trusts `locations.contains(BUFFER)`.
    pub(crate) fn check_bo_validity(&mut self) {
        if let Some(flag) = &self.bo_valid {
            if !flag.load(Ordering::Acquire) {
                self.bo_valid = None;
                if self.locations.contains(Locations::BUFFER) {
                    self.invalidate_range(Locations::BUFFER, 0, 0);
                }
            }
        }
    }

    pub(crate) fn host_mem_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.host_mem.as_mut()
    }

    pub(crate) fn ensure_host_mem_pub(&mut self) -> &mut Vec<u8> {
        self.ensure_host_mem()
    }

    pub(crate) fn locations_mut(&mut self) -> &mut Locations {
        &mut self.locations
    }

    pub(crate) fn byte_width(&self) -> u64 {
        self.desc.byte_width
    }

    pub(crate) fn draw_count(&self) -> u32 {
        self.draw_count
    }

    pub(crate) fn decl_change_count(&self) -> u32 {
        self.decl_change_count
    }

    pub(crate) fn full_conversion_count(&self) -> u32 {
        self.full_conversion_count
    }

    /// Host memory, if currently allocated.
    pub fn host_mem(&self) -> Option<&[u8]> {
        self.host_mem.as_deref()
    }

    fn ensure_host_mem(&mut self) -> &mut Vec<u8> {
        let size = self.desc.byte_width as usize;
        self.host_mem.get_or_insert_with(|| vec![0u8; size])
    }

    /// `load_location(L)`: ensure `L` is valid, migrating data into it
    /// from whichever location currently is, per spec.md §4.D.
    pub fn load_location(&mut self, location: Locations) -> Result<(), LoadError> {
        self.check_bo_validity();
        if self.locations.contains(location) {
            return Ok(());
        }
        if self.locations.is_empty() {
            self.locations = Locations::DISCARDED;
            return self.load_location(location);
        }
        if !self.backend.prepare(location) {
            return Err(LoadError::ResidencyFailed(location));
        }
        if location == Locations::BUFFER {
            self.ensure_bo_registered();
        }
        if self.locations.contains(Locations::DISCARDED) {
            self.locations.remove(Locations::DISCARDED);
            self.locations.insert(location);
            return Ok(());
        }

        match location {
            Locations::SYSMEM => {
                if self.locations.contains(Locations::CLEARED) {
                    let size = self.desc.byte_width as usize;
                    self.host_mem = Some(vec![0u8; size]);
                } else {
                    let size = self.desc.byte_width as usize;
                    self.ensure_host_mem();
                    let host = self.host_mem.as_mut().unwrap();
                    self.backend.download(0, &mut host[..size]);
                }
            }
            Locations::BUFFER => {
                if self.locations.contains(Locations::CLEARED) {
                    self.backend.prepare(Locations::SYSMEM);
                    self.ensure_host_mem().iter_mut().for_each(|b| *b = 0);
                }
                match &self.conversion {
                    None => self.upload_dirty_ranges(),
                    Some(_) => self.upload_with_conversion(),
                }
            }
            _ => {}
        }

        self.validate_location(location);
        Ok(())
    }

    fn validate_location(&mut self, location: Locations) {
        self.locations.validate(location, &mut self.dirty);
        if location == Locations::BUFFER
            && self.host_mem.is_some()
            && !self.desc.usage.contains(BufferUsage::DYNAMIC)
            && !self.pin_sysmem
        {
            self.host_mem = None;
        }
    }

    fn upload_dirty_ranges(&mut self) {
        let whole_buffer = self.dirty.fully_dirty();
        let host_mem = match &self.host_mem {
            Some(mem) => mem.clone(),
            None => return,
        };
        for range in self.dirty.iter() {
            let start = range.offset as usize;
            let end = range.end() as usize;
            self.backend.upload(range.offset, &host_mem[start..end], whole_buffer && self.dirty.len() == 1);
        }
    }

    fn upload_with_conversion(&mut self) {
        let size = self.desc.byte_width;
        let map = match &self.conversion {
            Some(m) => m.clone(),
            None => return,
        };
        let ranges: Vec<_> = self.dirty.iter().copied().collect();
        let whole_buffer = self.dirty.fully_dirty();
        let host_mem = match &self.host_mem {
            Some(mem) => mem.clone(),
            None => return,
        };
        for range in ranges {
            let mut scratch = host_mem.clone();
            convert_range(&mut scratch, &map, range.offset, range.end(), size);
            let start = range.offset as usize;
            let end = range.end() as usize;
            self.backend.upload(range.offset, &scratch[start..end], whole_buffer && self.dirty.len() == 1);
        }
    }

    /// `load_sysmem()`: load and pin SYSMEM, returning the host bytes.
    pub fn load_sysmem(&mut self) -> Result<&[u8], LoadError> {
        self.load_location(Locations::SYSMEM)?;
        self.pin_sysmem = true;
        Ok(self.host_mem.as_deref().unwrap_or(&[]))
    }

    /// `get_memory`: resolve which concrete location should be used, lazily
    /// materializing it if the buffer is currently discarded/cleared.
    pub fn get_memory(&mut self) -> Result<Residency, LoadError> {
        if self.locations.intersects(Locations::DISCARDED | Locations::CLEARED) {
            let target = if self.use_bo { Locations::BUFFER } else { Locations::SYSMEM };
            self.load_location(target)?;
            return Ok(if target == Locations::BUFFER { Residency::Bo } else { Residency::SysMem });
        }
        if self.locations.contains(Locations::BUFFER) {
            Ok(Residency::Bo)
        } else {
            self.load_location(Locations::SYSMEM)?;
            Ok(Residency::SysMem)
        }
    }

    /// Invalidate `location` over `[offset, offset+size)`, recovering
    /// locally via `DISCARDED` if the set would otherwise become empty
    /// (spec.md §4.B).
    pub(crate) fn invalidate_range(&mut self, location: Locations, offset: u64, size: u64) {
        if let Err(CoherenceViolation(_)) = self.locations.invalidate_range(location, offset, size, &mut self.dirty) {
            self.locations = Locations::DISCARDED;
        }
    }

    /// Run declaration inspection for this buffer against `state`
    /// (spec.md §4.E), skipping it when the buffer is `STATICDECL` and a
    /// declaration has already been seen.
    pub(crate) fn inspect_declaration(&mut self, state: &StreamState) -> bool {
        if self.desc.usage.contains(BufferUsage::STATICDECL) && self.has_desc {
            return false;
        }
        let changed = conversion::inspect_declaration(&mut self.conversion, self.id, state);
        if let Some(map) = &self.conversion {
            self.stride = map.stride();
        } else {
            self.stride = 0;
        }
        self.has_desc = true;
        changed
    }

    pub(crate) fn bump_decl_change_count(&mut self) {
        self.decl_change_count += 1;
    }

    pub(crate) fn bump_full_conversion_count(&mut self) {
        self.full_conversion_count += 1;
    }

    pub(crate) fn reset_draw_count(&mut self) {
        self.draw_count = 0;
    }

    pub(crate) fn decay_counters(&mut self) {
        self.draw_count += 1;
        if self.draw_count >= config::VB_RESET_DECL_CHANGE {
            self.decl_change_count = 0;
        }
        if self.draw_count >= config::VB_RESET_FULL_CONVS {
            self.full_conversion_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;

    fn desc(byte_width: u64, bind_flags: BindFlags, usage: BufferUsage, access: AccessFlags) -> BufferDesc {
        BufferDesc { byte_width, usage, bind_flags, access, structure_byte_stride: 0 }
    }

    #[test]
    fn zero_size_is_rejected() {
        let d = desc(0, BindFlags::VERTEX, BufferUsage::empty(), AccessFlags::MAP_WRITE);
        let err = Buffer::create(d, Arc::new(NullBackend), None).unwrap_err();
        assert_eq!(err, CreationError::ZeroSize);
    }

    #[test]
    fn misaligned_constant_buffer_is_rejected() {
        let d = desc(17, BindFlags::CONSTANT, BufferUsage::DYNAMIC, AccessFlags::MAP_WRITE);
        let err = Buffer::create(d, Arc::new(NullBackend), None).unwrap_err();
        assert_eq!(err, CreationError::Misaligned(16));
    }

    #[test]
    fn static_buffer_without_initial_data_is_rejected() {
        let d = desc(16, BindFlags::VERTEX, BufferUsage::empty(), AccessFlags::GPU);
        let err = Buffer::create(d, Arc::new(NullBackend), None).unwrap_err();
        assert_eq!(err, CreationError::MissingInitialData);
    }

    #[test]
    fn create_with_initial_data_populates_sysmem() {
        let d = desc(4, BindFlags::VERTEX, BufferUsage::empty(), AccessFlags::GPU);
        let buffer = Buffer::create(d, Arc::new(NullBackend), Some(&[1, 2, 3, 4])).unwrap();
        assert!(buffer.locations().contains(Locations::SYSMEM));
        assert_eq!(buffer.host_mem(), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn load_location_is_a_noop_when_already_valid() {
        let d = desc(4, BindFlags::VERTEX, BufferUsage::DYNAMIC, AccessFlags::MAP_WRITE);
        let mut buffer = Buffer::create(d, Arc::new(NullBackend), None).unwrap();
        buffer.load_location(Locations::SYSMEM).unwrap();
        let before = buffer.host_mem().unwrap().to_vec();
        buffer.load_location(Locations::SYSMEM).unwrap();
        assert_eq!(buffer.host_mem().unwrap(), &before[..]);
    }

    #[test]
    fn load_location_from_cleared_zero_fills() {
        let d = desc(4, BindFlags::VERTEX, BufferUsage::DYNAMIC, AccessFlags::MAP_WRITE);
        let mut buffer = Buffer::create(d, Arc::new(NullBackend), None).unwrap();
        assert!(buffer.locations().contains(Locations::CLEARED));
        buffer.load_location(Locations::SYSMEM).unwrap();
        assert_eq!(buffer.host_mem(), Some(&[0u8; 4][..]));
    }

    #[test]
    fn load_location_refused_by_backend_is_residency_failure() {
        let d = desc(4, BindFlags::VERTEX, BufferUsage::DYNAMIC, AccessFlags::MAP_WRITE);
        let mut buffer = Buffer::create(d, Arc::new(NullBackend), None).unwrap();
        let err = buffer.load_location(Locations::BUFFER).unwrap_err();
        assert_eq!(err, LoadError::ResidencyFailed(Locations::BUFFER));
    }

    #[test]
    fn clean_draws_decay_both_counters_independently() {
        let d = desc(4, BindFlags::VERTEX, BufferUsage::DYNAMIC, AccessFlags::MAP_WRITE);
        let mut buffer = Buffer::create(d, Arc::new(NullBackend), None).unwrap();
        buffer.bump_decl_change_count();
        buffer.bump_full_conversion_count();
        assert_eq!(buffer.decl_change_count(), 1);
        assert_eq!(buffer.full_conversion_count(), 1);

        for _ in 0..config::VB_RESET_FULL_CONVS {
            buffer.decay_counters();
        }
        // 20 clean draws: full_conversion_count resets, decl_change_count does not yet.
        assert_eq!(buffer.full_conversion_count(), 0);
        assert_eq!(buffer.decl_change_count(), 1);

        for _ in 0..(config::VB_RESET_DECL_CHANGE - config::VB_RESET_FULL_CONVS) {
            buffer.decay_counters();
        }
        // 1000 clean draws total: decl_change_count resets too.
        assert_eq!(buffer.decl_change_count(), 0);
    }
}
