//! Stack scanning with compiler-emitted stack maps.
//!
//! A mutator scans its own stack when it serves a stop request. Each frame
//! whose function has a stack map must be suspended at one of the map's
//! safepoints; the live offsets of that safepoint, applied to the frame's
//! stack pointer, give the root slots.

mod cursor;
mod stackmap;

#[cfg(unix)]
pub use stackmap::SymbolStackMaps;
pub use cursor::{BacktraceCursor, FrameCursor};
pub use stackmap::{
    DecodeError, NoStackMaps, Safepoint, StackMap, StackMapRegistry, StackMapSource, SYMBOL_PREFIX,
};

use std::ptr::NonNull;

use crate::heap::Slot;

/// A frame that cannot be scanned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    /// The function has a stack map, but no safepoint at the frame's resume
    /// address. The code generator and the runtime disagree.
    #[error("no safepoint in {function}() for ip={ip:#x}")]
    MissingSafepoint {
        /// Symbol name of the function.
        function: String,
        /// Resume address of the frame.
        ip: usize,
    },
}

/// Walks `cursor` to the outermost frame and calls `visit` for every live
/// root slot.
///
/// Frames of functions without a stack map are skipped. Returns the number
/// of frames that had one.
///
/// # Errors
///
/// Returns [`ScanError::MissingSafepoint`] for a mapped frame that is not at
/// one of its safepoints.
pub fn scan_frames(
    cursor: &mut dyn FrameCursor,
    maps: &dyn StackMapSource,
    visit: &mut dyn FnMut(Slot),
) -> Result<usize, ScanError> {
    let mut mapped = 0;
    while cursor.step() {
        let Some(function) = cursor.proc_name() else {
            continue;
        };
        let Some(map) = maps.lookup(&function) else {
            continue;
        };
        let ip = cursor.ip();
        let safepoint = map
            .safepoint(ip)
            .ok_or(ScanError::MissingSafepoint { function, ip })?;
        let sp = cursor.sp();
        for &offset in &safepoint.live_offsets {
            let addr = sp.wrapping_add_signed(offset as isize);
            if let Some(slot) = NonNull::new(addr as *mut *mut u8) {
                // SAFETY: the stack map describes a live, pointer-sized
                // reference slot in a frame that stays suspended until the
                // scan is over.
                visit(unsafe { Slot::from_raw(slot) });
            }
        }
        mapped += 1;
    }
    Ok(mapped)
}
