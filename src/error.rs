//! Error types returned from public entry points (spec.md §7).
//!
//! The policy is "recover locally when semantically equivalent (range
//! coalescing, DISCARDED recovery), surface everything else." No
//! exceptions are used as control flow; every fallible operation returns
//! a `Result`.

use crate::location::Locations;

/// Errors creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreationError {
    /// `byte_width` was zero.
    #[error("buffer byte_width must be greater than zero")]
    ZeroSize,
    /// A constant buffer's `byte_width` was not a multiple of the
    /// constant-buffer alignment (16 bytes).
    #[error("constant buffer byte_width must be a multiple of {0} bytes")]
    Misaligned(u64),
    /// Initial data was requested but no data pointer was supplied.
    #[error("initial data was requested but no data was supplied")]
    MissingInitialData,
    /// The backend refused to create the requested resource.
    #[error("backend refused buffer creation: {0}")]
    Backend(String),
}

/// Errors from [`crate::mapping::map`]/`unmap`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// `sub_index != 0` (only subresource 0 exists on a buffer).
    #[error("invalid subresource index")]
    InvalidSubresource,
    /// A host or device allocation required to satisfy the map failed.
    #[error("out of memory while mapping")]
    OutOfMemory,
}

/// Errors from [`crate::buffer::Buffer::load_location`] and the load
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// `Backend::prepare` returned `false` for the requested location.
    #[error("failed to prepare storage for location {0:?}")]
    ResidencyFailed(Locations),
}
