//! Compiler-emitted stack maps.
//!
//! The code generator emits one table per function under the symbol
//! `__gcmap_<function>`:
//!
//! ```text
//! i32 point_count
//! point_count times:
//!     <pad to pointer alignment>
//!     ptr safepoint_address
//!     i32 frame_size
//!     i32 live_count
//!     i32 live_offsets[live_count]
//! ```
//!
//! Offsets are relative to the frame's stack pointer at the safepoint.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::RwLock;

const PTR_SIZE: usize = mem::size_of::<usize>();

/// Symbol prefix of emitted stack maps.
pub const SYMBOL_PREFIX: &str = "__gcmap_";

/// One safepoint of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Safepoint {
    /// Resume address of the call that forms the safepoint.
    pub address: usize,
    /// Frame size of the function.
    pub frame_size: i32,
    /// Stack-pointer-relative offsets of the live reference slots.
    pub live_offsets: Vec<i32>,
}

/// The safepoints of one function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackMap {
    points: Vec<Safepoint>,
}

/// Why a stack map could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The table ends before the announced contents.
    #[error("stack map truncated at byte {at}")]
    Truncated {
        /// Offset of the first missing byte.
        at: usize,
    },
    /// A count field is negative.
    #[error("negative {field} in stack map")]
    NegativeCount {
        /// Name of the offending field.
        field: &'static str,
    },
}

impl StackMap {
    /// Creates a map from decoded safepoints.
    #[must_use]
    pub const fn new(points: Vec<Safepoint>) -> Self {
        Self { points }
    }

    /// All safepoints.
    #[must_use]
    pub fn points(&self) -> &[Safepoint] {
        &self.points
    }

    /// The safepoint whose address is exactly `ip`.
    #[must_use]
    pub fn safepoint(&self, ip: usize) -> Option<&Safepoint> {
        self.points.iter().find(|point| point.address == ip)
    }

    /// Decodes the emitted table layout. `bytes` must start at the table
    /// symbol, which is pointer-aligned.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the table is truncated or malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let count = reader.count("point_count")?;
        let mut points = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            reader.align(PTR_SIZE);
            let address = reader.usize()?;
            let frame_size = reader.i32()?;
            let live_count = reader.count("live_count")?;
            let live_offsets = (0..live_count)
                .map(|_| reader.i32())
                .collect::<Result<Vec<_>, _>>()?;
            points.push(Safepoint {
                address,
                frame_size,
                live_offsets,
            });
        }
        Ok(Self { points })
    }

    /// Length in bytes of the table starting at `table`.
    ///
    /// # Safety
    ///
    /// `table` must point to a complete, well-formed emitted table.
    unsafe fn extent(table: *const u8) -> usize {
        let read_i32 = |at: usize| {
            // SAFETY: within the table, per the caller.
            let raw = unsafe { table.add(at).cast::<i32>().read_unaligned() };
            usize::try_from(raw).unwrap_or(0)
        };
        let count = read_i32(0);
        let mut at: usize = 4;
        for _ in 0..count {
            at = at.next_multiple_of(PTR_SIZE) + PTR_SIZE + 4;
            let live = read_i32(at);
            at += 4 + 4 * live;
        }
        at
    }
}

/// Cursor over a byte slice with bounds checks.
struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn align(&mut self, to: usize) {
        self.at = self.at.next_multiple_of(to);
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.at + N;
        let chunk = self
            .bytes
            .get(self.at..end)
            .ok_or(DecodeError::Truncated { at: self.at })?;
        self.at = end;
        let mut out = [0; N];
        out.copy_from_slice(chunk);
        Ok(out)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.take().map(i32::from_ne_bytes)
    }

    fn usize(&mut self) -> Result<usize, DecodeError> {
        self.take().map(usize::from_ne_bytes)
    }

    fn count(&mut self, field: &'static str) -> Result<usize, DecodeError> {
        let raw = self.i32()?;
        usize::try_from(raw).map_err(|_| DecodeError::NegativeCount { field })
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Maps function names to their stack maps.
pub trait StackMapSource: Send + Sync {
    /// The stack map of `function`, if it has one.
    fn lookup(&self, function: &str) -> Option<Arc<StackMap>>;

    /// Returns `true` if no function can have a map, so stack walks can be
    /// skipped altogether.
    fn is_empty(&self) -> bool {
        false
    }
}

/// A source without any stack map: for runtimes whose mutators keep their
/// references in shadow roots only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStackMaps;

impl StackMapSource for NoStackMaps {
    fn lookup(&self, _function: &str) -> Option<Arc<StackMap>> {
        None
    }

    fn is_empty(&self) -> bool {
        true
    }
}

/// An in-memory table of stack maps keyed by function name.
#[derive(Default)]
pub struct StackMapRegistry {
    maps: RwLock<HashMap<String, Arc<StackMap>>>,
}

impl fmt::Debug for StackMapRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackMapRegistry")
            .field("functions", &self.maps.read().len())
            .finish()
    }
}

impl StackMapRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the map of `function`.
    pub fn insert(&self, function: impl Into<String>, map: StackMap) {
        self.maps.write().insert(function.into(), Arc::new(map));
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.read().len()
    }

    /// Returns `true` if no function is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.read().is_empty()
    }
}

impl StackMapSource for StackMapRegistry {
    fn lookup(&self, function: &str) -> Option<Arc<StackMap>> {
        self.maps.read().get(function).cloned()
    }

    fn is_empty(&self) -> bool {
        Self::is_empty(self)
    }
}

/// Stack maps linked into the process, found through the dynamic symbol
/// table as `__gcmap_<function>`.
///
/// Lookups (hits and misses) are cached per function name.
#[cfg(unix)]
#[derive(Default)]
pub struct SymbolStackMaps {
    cache: RwLock<HashMap<String, Option<Arc<StackMap>>>>,
}

#[cfg(unix)]
impl fmt::Debug for SymbolStackMaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolStackMaps")
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

#[cfg(unix)]
impl SymbolStackMaps {
    /// Creates a source with an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(function: &str) -> Option<StackMap> {
        let symbol = CString::new(format!("{SYMBOL_PREFIX}{function}")).ok()?;
        // SAFETY: `symbol` is a valid C string; RTLD_DEFAULT searches the
        // global symbol scope.
        let table = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
        if table.is_null() {
            return None;
        }
        let table = table.cast::<u8>().cast_const();
        // SAFETY: `__gcmap_` symbols are emitted by the code generator in the
        // documented layout.
        let bytes = unsafe { std::slice::from_raw_parts(table, StackMap::extent(table)) };
        match StackMap::decode(bytes) {
            Ok(map) => Some(map),
            Err(err) => {
                tracing::error!(function, %err, "malformed stack map");
                None
            }
        }
    }
}

#[cfg(unix)]
impl StackMapSource for SymbolStackMaps {
    fn lookup(&self, function: &str) -> Option<Arc<StackMap>> {
        if let Some(cached) = self.cache.read().get(function) {
            return cached.clone();
        }
        let resolved = Self::resolve(function).map(Arc::new);
        self.cache
            .write()
            .insert(function.to_owned(), resolved.clone());
        resolved
    }
}
