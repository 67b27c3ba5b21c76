//! Per-draw load orchestrator (component G): decides when to (re)convert
//! and when to abandon device residency.

use crate::buffer::Buffer;
use crate::config;
use crate::conversion::StreamState;
use crate::error::LoadError;
use crate::location::Locations;

/// `load(state)`: called once per draw for each bound buffer (spec.md §4.G).
pub fn load(buffer: &mut Buffer, state: Option<&StreamState>) -> Result<(), LoadError> {
    if buffer.mapped_via_bo() && buffer.map_count() > 0 {
        return Ok(());
    }
    if !buffer.use_bo() {
        return Ok(());
    }

    if !buffer.backend().prepare(Locations::BUFFER) {
        return Err(LoadError::ResidencyFailed(Locations::BUFFER));
    }

    let mut declaration_changed = false;
    if let Some(state) = state {
        declaration_changed = buffer.inspect_declaration(state);
    }

    let fully_dirty = buffer.dirty().fully_dirty();
    if !declaration_changed && !(buffer.has_desc() && buffer.dirty().dirty()) {
        buffer.decay_counters();
        return Ok(());
    }

    if declaration_changed {
        buffer.bump_decl_change_count();
        buffer.reset_draw_count();
        let conversion_active = buffer.conversion().is_some();
        if buffer.decl_change_count() > config::VB_MAX_DECL_CHANGES
            || (conversion_active && buffer.desc().usage.contains(crate::buffer::BufferUsage::DYNAMIC))
        {
            buffer.set_use_bo(false);
        } else {
            buffer.invalidate_range(Locations::BUFFER, 0, 0);
        }
    } else if buffer.conversion().is_some() && fully_dirty {
        buffer.bump_full_conversion_count();
        if buffer.full_conversion_count() > config::VB_MAX_FULL_CONVERSIONS {
            buffer.set_use_bo(false);
        }
    }

    if !buffer.use_bo() {
        return Ok(());
    }

    buffer.load_location(Locations::BUFFER)
}
