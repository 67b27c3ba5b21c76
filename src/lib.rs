// Copyright 2014 The Gfx-rs Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! GPU buffer residency and vertex-conversion engine.
//!
//! A [`buffer::Buffer`] is a byte-addressable resource whose authoritative
//! bytes may live in host memory, a device buffer object, or neither (when
//! discarded or implicitly cleared). It tracks which locations are valid,
//! lazily migrates data between them on demand, and — for buffers bound as
//! vertex streams under a fixed-function pipeline that cannot consume the
//! application's native vertex formats — rewrites individual attributes in
//! place as part of that migration.

#[macro_use]
extern crate bitflags;

pub mod backend;
pub mod buffer;
pub mod config;
pub mod conversion;
pub mod error;
pub mod load;
pub mod location;
pub mod mapping;
pub mod range;
pub mod streaming;

/// Identifies a buffer for the purposes of vertex-stream bindings
/// ([`conversion::StreamElement`]) without borrowing it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferId(pub u64);
