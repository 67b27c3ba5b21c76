//! Per-vertex conversion engine (component E).
//!
//! Tracks, per byte of a vertex stride, the reformat required on upload,
//! recomputes that map whenever the declared vertex layout changes, and
//! applies the reformat in place during upload.

use crate::BufferId;
use std::convert::TryInto;

bitflags! {
    /// Fixups the draw-time state decides are needed, derived externally
    /// from whether the fixed-function vertex pipeline is active and
    /// which native formats the device supports (spec.md §4.E).
    pub struct FixupFlags: u8 {
        /// BGRA↔RGBA swizzle for packed color attributes.
        const D3DCOLOR = 0x1;
        /// Divide-through of transformed, lit (`xyzrhw`) positions.
        const XYZRHW   = 0x2;
    }
}

/// The reformat applied to one byte position within a vertex stride.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConversionKind {
    /// 4-byte passthrough; no reformat.
    None,
    /// 4-byte BGRA↔RGBA swizzle: keep the `A`/`G` lanes, swap `R`↔`B`.
    D3DColor,
    /// 16-byte `vec4` divided through by `w` (when `w ∉ {0, 1}`), then
    /// `w` replaced by `1/w`.
    PositionT,
}

impl ConversionKind {
    /// Byte width this reformat consumes when walking a vertex.
    pub fn byte_width(self) -> u32 {
        match self {
            ConversionKind::None | ConversionKind::D3DColor => 4,
            ConversionKind::PositionT => 16,
        }
    }
}

/// A byte-granular table of length `stride` recording the reformat
/// applied to each byte position of a vertex on upload.
#[derive(Clone, Debug)]
pub struct ConversionMap {
    entries: Vec<ConversionKind>,
    stride: u32,
}

impl ConversionMap {
    /// An all-`None` map of the given stride (invariant: `|conversion| == stride`).
    pub fn new_none(stride: u32) -> Self {
        ConversionMap {
            entries: vec![ConversionKind::None; stride as usize],
            stride,
        }
    }

    /// The stride this map was built for.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// The reformat recorded at byte position `idx`.
    pub fn entry(&self, idx: usize) -> ConversionKind {
        self.entries[idx]
    }

    fn set(&mut self, idx: usize, kind: ConversionKind) -> bool {
        if self.entries[idx] != kind {
            self.entries[idx] = kind;
            true
        } else {
            false
        }
    }
}

/// The 14 fixed-function slots, in the order the source walks them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FixedFunctionSlot {
    /// Vertex position.
    Position,
    /// Skinning blend weights.
    BlendWeight,
    /// Skinning blend indices.
    BlendIndices,
    /// Vertex normal.
    Normal,
    /// Diffuse color.
    Diffuse,
    /// Specular color.
    Specular,
    /// Texture coordinate set 0.
    TexCoord0,
    /// Texture coordinate set 1.
    TexCoord1,
    /// Texture coordinate set 2.
    TexCoord2,
    /// Texture coordinate set 3.
    TexCoord3,
    /// Texture coordinate set 4.
    TexCoord4,
    /// Texture coordinate set 5.
    TexCoord5,
    /// Texture coordinate set 6.
    TexCoord6,
    /// Texture coordinate set 7.
    TexCoord7,
}

impl FixedFunctionSlot {
    /// All 14 slots, in the fixed order declaration inspection walks them.
    pub const ALL: [FixedFunctionSlot; 14] = [
        FixedFunctionSlot::Position,
        FixedFunctionSlot::BlendWeight,
        FixedFunctionSlot::BlendIndices,
        FixedFunctionSlot::Normal,
        FixedFunctionSlot::Diffuse,
        FixedFunctionSlot::Specular,
        FixedFunctionSlot::TexCoord0,
        FixedFunctionSlot::TexCoord1,
        FixedFunctionSlot::TexCoord2,
        FixedFunctionSlot::TexCoord3,
        FixedFunctionSlot::TexCoord4,
        FixedFunctionSlot::TexCoord5,
        FixedFunctionSlot::TexCoord6,
        FixedFunctionSlot::TexCoord7,
    ];
}

/// The declared format of one vertex attribute, grounded in
/// `gfx_hal::pso::input_assembler::Element`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ElementFormat {
    /// Size of this attribute, in bytes.
    pub byte_count: u32,
    /// Whether this attribute is a packed D3DCOLOR-style format eligible
    /// for the BGRA↔RGBA swizzle.
    pub is_d3dcolor: bool,
}

/// One vertex attribute binding, grounded in
/// `gfx_hal::pso::input_assembler::{VertexBufferDesc, AttributeDesc}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamElement {
    /// The buffer this attribute is bound to.
    pub buffer: BufferId,
    /// Which of the 14 fixed-function slots this attribute feeds.
    pub slot: FixedFunctionSlot,
    /// Stride, in bytes, of the bound vertex buffer.
    pub stride: u32,
    /// Byte offset of this attribute within one vertex.
    pub offset: u32,
    /// Declared format of this attribute.
    pub format: ElementFormat,
}

/// A full vertex declaration as seen at draw time.
#[derive(Clone, Debug, Default)]
pub struct StreamState {
    /// Every bound attribute, across every buffer.
    pub elements: Vec<StreamElement>,
    /// Fixups required by the current device/pipeline combination.
    pub fixup_flags: FixupFlags,
}

impl Default for FixupFlags {
    fn default() -> Self {
        FixupFlags::empty()
    }
}

/// Recompute `map` against `state` for attributes bound to `buffer_id`.
///
/// Returns `true` if the map changed (stride reset or any entry
/// updated), matching spec.md §4.E step 1–3.
pub fn inspect_declaration(map: &mut Option<ConversionMap>, buffer_id: BufferId, state: &StreamState) -> bool {
    let mut changed = false;
    let mut remaining = state.fixup_flags;
    let mut any_fixup_applied = false;

    for &slot in FixedFunctionSlot::ALL.iter() {
        let xyzrhw_active = slot == FixedFunctionSlot::Position && remaining.contains(FixupFlags::XYZRHW);

        if let Some(element) = state
            .elements
            .iter()
            .find(|e| e.buffer == buffer_id && e.slot == slot)
        {
            if map.as_ref().map(|m| m.stride()) != Some(element.stride) {
                *map = Some(ConversionMap::new_none(element.stride));
                changed = true;
            }
            let map_ref = map.as_mut().expect("just initialized above");

            let kind = if xyzrhw_active {
                ConversionKind::PositionT
            } else if element.format.is_d3dcolor && remaining.contains(FixupFlags::D3DCOLOR) {
                ConversionKind::D3DColor
            } else {
                ConversionKind::None
            };
            if !matches!(kind, ConversionKind::None) {
                any_fixup_applied = true;
            }

            let stride = map_ref.stride() as usize;
            if stride > 0 {
                for i in 0..element.format.byte_count {
                    let idx = (element.offset + i) as usize % stride;
                    if map_ref.set(idx, kind) {
                        changed = true;
                    }
                }
            }
        }

        // XYZRHW only ever applies to the position slot; consumed here
        // unconditionally so it can never leak onto a later slot.
        if slot == FixedFunctionSlot::Position {
            remaining.remove(FixupFlags::XYZRHW);
        }
    }

    if !any_fixup_applied && map.is_some() {
        *map = None;
        changed = true;
    }

    changed
}

/// Apply the BGRA↔RGBA swizzle: keep the `A`/`G` lanes, swap `R`↔`B`.
///
/// Defined only for little-endian hosts (spec.md §9); `chunk` is the raw
/// 4-byte lane as stored, assumed little-endian `B,G,R,A`.
pub fn apply_d3dcolor(chunk: &mut [u8]) {
    debug_assert_eq!(chunk.len(), 4);
    chunk.swap(0, 2);
}

/// Apply the transformed-position divide-through: `x,y,z ← x/w, y/w, z/w;
/// w ← 1/w`, skipped when `w` is already `0` or `1`.
pub fn apply_position_t(chunk: &mut [u8]) {
    debug_assert_eq!(chunk.len(), 16);
    let mut v = [0f32; 4];
    for (i, slot) in v.iter_mut().enumerate() {
        *slot = f32::from_le_bytes(chunk[i * 4..i * 4 + 4].try_into().unwrap());
    }
    let w = v[3];
    if w != 0.0 && w != 1.0 {
        let inv_w = 1.0 / w;
        v[0] *= inv_w;
        v[1] *= inv_w;
        v[2] *= inv_w;
        v[3] = inv_w;
    }
    for (i, slot) in v.iter().enumerate() {
        chunk[i * 4..i * 4 + 4].copy_from_slice(&slot.to_le_bytes());
    }
}

/// Walk vertex indices `⌊start/stride⌋ .. min(⌊end/stride⌋+1, size/stride)`
/// and apply the map's per-byte fixups in place, advancing by 4 bytes for
/// `None`/`D3DColor` and 16 for `PositionT` (spec.md §4.E "Upload with
/// conversion").
///
/// `data` is the scratch buffer for the whole resource (length `size`);
/// `start`/`end` bound one dirty range within it. Preserves the source's
/// documented off-by-one when `end` lands exactly on a stride boundary —
/// see spec.md §9 Open Question — but never reads past `data`.
pub fn convert_range(data: &mut [u8], map: &ConversionMap, start: u64, end: u64, size: u64) {
    let stride = map.stride() as u64;
    if stride == 0 {
        return;
    }
    let vertex_count = size / stride;
    let start_vertex = start / stride;
    let end_vertex = ((end / stride) + 1).min(vertex_count);

    for vertex in start_vertex..end_vertex {
        let base = (vertex * stride) as usize;
        let mut cursor = 0usize;
        while cursor < stride as usize {
            let kind = map.entry(cursor);
            let width = kind.byte_width() as usize;
            let chunk_start = base + cursor;
            let chunk_end = chunk_start + width;
            debug_assert!(chunk_end <= data.len(), "conversion walk read past scratch buffer");
            if chunk_end <= data.len() {
                match kind {
                    ConversionKind::None => {}
                    ConversionKind::D3DColor => apply_d3dcolor(&mut data[chunk_start..chunk_end]),
                    ConversionKind::PositionT => apply_position_t(&mut data[chunk_start..chunk_end]),
                }
            }
            cursor += width;
        }
    }
}
