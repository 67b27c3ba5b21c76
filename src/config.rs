//! Global tunables for the residency and conversion heuristics.
//!
//! Collected in one place so the thresholds driving [`crate::load`] read as
//! configuration rather than magic numbers scattered through the algorithm.

/// Declaration changes tolerated before a buffer's device residency is
/// abandoned permanently.
pub const VB_MAX_DECL_CHANGES: u32 = 100;

/// Consecutive clean draws (no declaration change) after which
/// `decl_change_count` decays back to zero.
pub const VB_RESET_DECL_CHANGE: u32 = 1000;

/// Consecutive fully-dirty conversions tolerated before device residency is
/// abandoned permanently.
pub const VB_MAX_FULL_CONVERSIONS: u32 = 5;

/// Consecutive draws without a full conversion after which
/// `full_conversion_count` decays back to zero.
pub const VB_RESET_FULL_CONVS: u32 = 20;

/// Minimum capacity of a streaming buffer, in bytes.
pub const SB_MIN_SIZE: u64 = 512 * 1024;

/// Required alignment, in bytes, for constant-buffer byte widths.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 16;

/// Required alignment, in bytes, of a backend's mapped BO pointer. A
/// pointer failing this check trips the first-map alignment fallback
/// (spec.md §4.F, scenario S6).
pub const RESOURCE_ALIGNMENT: usize = 16;
