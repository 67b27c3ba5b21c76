//! Location bitset and its transitions (component B).

use crate::range::RangeSet;

bitflags! {
    /// The set of locations a buffer's authoritative bytes may currently
    /// reside in.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Locations: u8 {
        /// Host memory (`host_mem`) is valid.
        const SYSMEM    = 0x1;
        /// The device buffer object is valid.
        const BUFFER    = 0x2;
        /// Contents are undefined; no copy is required to populate any
        /// other location.
        const DISCARDED = 0x4;
        /// Contents are implicitly zero; materializing any location means
        /// zero-filling it rather than copying.
        const CLEARED   = 0x8;
    }
}

/// Raised when a transition would leave a buffer with no valid location.
///
/// This is always recovered locally (spec.md §4.B): the caller re-enters
/// via [`Locations::DISCARDED`] and retries. The error exists so callers
/// can log the occurrence, which should never happen in a correctly
/// sequenced caller but is defended against because the source treats it
/// as a bug report, not a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer location set became empty after invalidating {0:?}")]
pub struct CoherenceViolation(pub Locations);

impl Locations {
    /// `validate(L)`: mark `L` as holding authoritative data.
    ///
    /// If `L == BUFFER`, the dirty range set is cleared first — a freshly
    /// validated device buffer has nothing left to repopulate from
    /// elsewhere.
    pub fn validate(&mut self, location: Locations, dirty: &mut RangeSet) {
        if location == Locations::BUFFER {
            dirty.clear();
        }
        self.insert(location);
        // A concrete location is now valid; the pseudo-locations no longer
        // apply (invariant 2, spec.md §3).
        if concrete_mask().intersects(location) {
            self.remove(Locations::DISCARDED | Locations::CLEARED);
        }
    }

    /// `invalidate_range(L, off, size)`: `L` is no longer authoritative
    /// over `[off, off+size)`; the range is recorded as dirty so it can
    /// be repopulated from whichever location remains valid.
    ///
    /// Returns `Err` (recoverable, per spec.md §4.B) if removing `L`
    /// leaves the set empty.
    pub fn invalidate_range(
        &mut self,
        location: Locations,
        offset: u64,
        size: u64,
        dirty: &mut RangeSet,
    ) -> Result<(), CoherenceViolation> {
        if location == Locations::BUFFER {
            dirty.invalidate(offset, size);
        }
        self.remove(location);
        if self.is_empty() {
            log::warn!("buffer location set emptied by invalidating {:?}; recovering via DISCARDED", location);
            return Err(CoherenceViolation(location));
        }
        Ok(())
    }

    /// `invalidate(L)` ≡ `invalidate_range(L, 0, 0)`.
    pub fn invalidate(&mut self, location: Locations, dirty: &mut RangeSet) -> Result<(), CoherenceViolation> {
        self.invalidate_range(location, 0, 0, dirty)
    }
}

fn concrete_mask() -> Locations {
    Locations::SYSMEM | Locations::BUFFER
}
