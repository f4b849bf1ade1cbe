//! Mutator threads: registry entries, attach/detach and shadow roots.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{fatal, GcError};
use crate::heap::region::Region;
use crate::heap::{HeapKind, ObjectRef, Shared, Slot};
use crate::lockfree::{Linked, TreiberStack};
use crate::safepoint::{self, Rendezvous};

// ============================================================================
// Thread states
// ============================================================================

/// Executing mutator code.
pub(crate) const RUNNING: u8 = 0;
/// The collector asked the thread to stop at its next safepoint.
pub(crate) const GC_REQUESTED: u8 = 1;
/// Scanning its roots, at the rendezvous, or parked for the cycle.
pub(crate) const AT_SAFEPOINT: u8 = 2;
/// Detached; the collector skips the entry.
pub(crate) const DETACHED: u8 = 3;

thread_local! {
    static CURRENT: Cell<*const ThreadInfo> = const { Cell::new(ptr::null()) };
}

// ============================================================================
// ThreadInfo
// ============================================================================

/// The OS thread behind a registry entry.
struct Owner {
    name: Option<String>,
    #[cfg(unix)]
    pthread: libc::pthread_t,
}

impl Owner {
    fn current() -> Self {
        Self {
            name: std::thread::current().name().map(str::to_owned),
            // SAFETY: pthread_self has no preconditions.
            #[cfg(unix)]
            pthread: unsafe { libc::pthread_self() },
        }
    }
}

/// Registry entry of one attached thread.
///
/// Entries are never unlinked while the heap lives, so the collector can walk
/// the registry without synchronizing with attach and detach. A detached
/// entry is handed to the next thread that attaches; entries are freed when
/// the heap is torn down.
pub(crate) struct ThreadInfo {
    next: AtomicPtr<ThreadInfo>,
    id: AtomicU64,
    /// Rewritten only while the entry is detached, under the cycle lock.
    owner: UnsafeCell<Owner>,
    heap: NonNull<Shared>,
    state: AtomicU8,
    /// Raised by the stop-request signal handler, cleared by the owner.
    /// A hint only: `state` decides whether a request is pending.
    gc_waiting: AtomicBool,
    /// Mark value seen by the signal handler.
    snapshot_mark: AtomicU8,
    /// Mark stamped on this thread's new objects.
    current_mark: AtomicU8,
    local_region: AtomicPtr<Region>,
    /// Local region and its top when the cycle's mark was adopted. Objects
    /// below that point carry the previous mark unless traced.
    adopted_region: AtomicPtr<Region>,
    adopted_top: AtomicUsize,
    pub(crate) rendezvous: Rendezvous,
    shadow_roots: Mutex<Vec<Slot>>,
}

impl Linked for ThreadInfo {
    fn link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

impl fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadInfo")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ThreadInfo {
    fn new(heap: &Shared, id: u64, region: NonNull<Region>, mark: u8) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            id: AtomicU64::new(id),
            owner: UnsafeCell::new(Owner::current()),
            heap: NonNull::from(heap),
            state: AtomicU8::new(RUNNING),
            gc_waiting: AtomicBool::new(false),
            snapshot_mark: AtomicU8::new(mark),
            current_mark: AtomicU8::new(mark),
            local_region: AtomicPtr::new(region.as_ptr()),
            adopted_region: AtomicPtr::new(ptr::null_mut()),
            adopted_top: AtomicUsize::new(0),
            rendezvous: Rendezvous::new(),
            shadow_roots: Mutex::new(Vec::new()),
        }
    }

    /// Hands a detached entry to the calling thread. Returns `false` if the
    /// entry is in use.
    ///
    /// Must be called with the heap's cycle lock held.
    fn reattach(&self, id: u64, region: NonNull<Region>, mark: u8) -> bool {
        if self
            .state
            .compare_exchange(DETACHED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // SAFETY: the entry was detached and the cycle lock is held, so
        // neither the collector nor a previous owner reads it.
        unsafe { *self.owner.get() = Owner::current() };
        self.id.store(id, Ordering::Relaxed);
        self.gc_waiting.store(false, Ordering::Relaxed);
        self.snapshot_mark.store(mark, Ordering::Relaxed);
        self.current_mark.store(mark, Ordering::Relaxed);
        self.adopted_region.store(ptr::null_mut(), Ordering::Relaxed);
        self.set_local_region(Some(region));
        true
    }

    pub(crate) fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    fn owner(&self) -> &Owner {
        // SAFETY: the owner is only replaced by `reattach`, which no reader
        // can overlap: readers are the owning thread or the collector.
        unsafe { &*self.owner.get() }
    }

    pub(crate) fn name(&self) -> &str {
        self.owner().name.as_deref().unwrap_or("<unnamed>")
    }

    #[cfg(unix)]
    pub(crate) fn pthread(&self) -> libc::pthread_t {
        self.owner().pthread
    }

    fn heap(&self) -> &Shared {
        // SAFETY: the heap outlives every registry entry.
        unsafe { self.heap.as_ref() }
    }

    pub(crate) fn belongs_to(&self, heap: &Shared) -> bool {
        ptr::eq(self.heap.as_ptr(), heap)
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.state() == DETACHED
    }

    /// Collector side: RUNNING to GC_REQUESTED.
    ///
    /// Returns `false` if the thread is detached. Waits out a thread that is
    /// still leaving the previous cycle's safepoint.
    pub(crate) fn request_stop(&self) -> bool {
        let backoff = crossbeam::utils::Backoff::new();
        loop {
            match self.state.compare_exchange(
                RUNNING,
                GC_REQUESTED,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(DETACHED) => return false,
                Err(AT_SAFEPOINT) => backoff.snooze(),
                Err(state) => fatal!(
                    "thread {} is already asked to stop (state {state})",
                    self.id()
                ),
            }
        }
    }

    /// Whether the owner's fast-path check should take the slow path.
    pub(crate) fn stop_hinted(&self) -> bool {
        self.gc_waiting.load(Ordering::Relaxed)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.state() == GC_REQUESTED
    }

    /// Runs in the stop-request signal handler: atomics only.
    fn note_stop_request(&self) {
        let mark = self.heap().state.mark();
        self.snapshot_mark.store(mark, Ordering::Relaxed);
        self.gc_waiting.store(true, Ordering::Release);
    }

    /// Owner side: GC_REQUESTED to AT_SAFEPOINT. Clears the hint flag; a
    /// hint without a pending request is stale and ignored.
    pub(crate) fn enter_safepoint(&self) -> bool {
        self.gc_waiting.store(false, Ordering::Relaxed);
        self.state
            .compare_exchange(GC_REQUESTED, AT_SAFEPOINT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn leave_safepoint(&self) {
        self.state.store(RUNNING, Ordering::Release);
    }

    /// Records the mark of the cycle being served. The handler may have
    /// captured it already, or captured an older request's value when the
    /// hint was stale; the global mark is stable while the request pends.
    pub(crate) fn record_snapshot(&self, mark: u8) {
        self.snapshot_mark.store(mark, Ordering::Relaxed);
    }

    /// Starts stamping new objects with the cycle's mark. Called after the
    /// root scan, so objects allocated before it are still traced.
    ///
    /// Also records where the local region stood, for [`allocation_boundary`].
    ///
    /// [`allocation_boundary`]: Self::allocation_boundary
    pub(crate) fn adopt_snapshot(&self) {
        let region = self.local_region();
        if let Some(region) = region {
            // SAFETY: the owner's local region stays mapped while it is local.
            let top = unsafe { region.as_ref() }.top();
            self.adopted_top.store(top, Ordering::Relaxed);
        }
        self.adopted_region.store(
            region.map_or(ptr::null_mut(), NonNull::as_ptr),
            Ordering::Relaxed,
        );
        let mark = self.snapshot_mark.load(Ordering::Relaxed);
        self.current_mark.store(mark, Ordering::Relaxed);
    }

    /// The local region and its top at the last mark adoption.
    ///
    /// Read by the collector after the rendezvous of the same cycle. The
    /// region may have been handed to the global list since, but no cycle
    /// has reclaimed it yet.
    pub(crate) fn allocation_boundary(&self) -> Option<(NonNull<Region>, usize)> {
        let region = NonNull::new(self.adopted_region.load(Ordering::Relaxed))?;
        Some((region, self.adopted_top.load(Ordering::Relaxed)))
    }

    pub(crate) fn current_mark(&self) -> u8 {
        self.current_mark.load(Ordering::Relaxed)
    }

    pub(crate) fn local_region(&self) -> Option<NonNull<Region>> {
        NonNull::new(self.local_region.load(Ordering::Acquire))
    }

    pub(crate) fn set_local_region(&self, region: Option<NonNull<Region>>) {
        let raw = region.map_or(ptr::null_mut(), NonNull::as_ptr);
        self.local_region.store(raw, Ordering::Release);
    }

    pub(crate) fn shadow_roots(&self) -> Vec<Slot> {
        self.shadow_roots.lock().clone()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Lock-free list of every thread that ever attached.
pub(crate) struct ThreadRegistry {
    entries: TreiberStack<ThreadInfo>,
}

impl ThreadRegistry {
    pub(crate) const fn new(retry_limit: u32) -> Self {
        Self {
            entries: TreiberStack::new("thread registry", retry_limit),
        }
    }

    /// Hands a detached entry to the calling thread, if there is one.
    ///
    /// Must be called with the heap's cycle lock held.
    fn reuse(&self, id: u64, region: NonNull<Region>, mark: u8) -> Option<&ThreadInfo> {
        self.iter().find(|info| info.reattach(id, region, mark))
    }

    /// # Safety
    ///
    /// `info` must have been leaked from a `Box` and not be registered yet.
    unsafe fn register(&self, info: NonNull<ThreadInfo>) {
        // SAFETY: forwarded from the caller.
        unsafe { self.entries.push(info) };
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.entries.iter()
    }

    /// Attached threads.
    pub(crate) fn active(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.iter().filter(|info| !info.is_detached())
    }

    /// Frees every entry.
    ///
    /// # Safety
    ///
    /// No thread may be attached and nothing may iterate concurrently.
    pub(crate) unsafe fn free_all(&self) -> usize {
        let mut freed = 0;
        for info in self.entries.take_all() {
            // SAFETY: entries were leaked from boxes in `attach`.
            drop(unsafe { Box::from_raw(info.as_ptr()) });
            freed += 1;
        }
        freed
    }
}

// ============================================================================
// Thread-local access
// ============================================================================

/// The calling thread's entry, if it is attached.
pub(crate) fn current() -> Option<NonNull<ThreadInfo>> {
    CURRENT
        .try_with(|current| NonNull::new(current.get().cast_mut()))
        .ok()
        .flatten()
}

fn set_current(info: *const ThreadInfo) {
    CURRENT.with(|current| current.set(info));
}

/// Entry point of the stop-request signal handler.
pub(crate) fn on_stop_signal() {
    let _ = CURRENT.try_with(|current| {
        // SAFETY: the pointer is cleared before the entry could be freed.
        if let Some(info) = unsafe { current.get().as_ref() } {
            info.note_stop_request();
        }
    });
}

/// Attaches the calling thread to `heap`.
pub(crate) fn attach(heap: &Shared) -> Result<MutatorGuard<'_>, GcError> {
    if current().is_some() {
        return Err(GcError::AlreadyAttached);
    }
    let region = heap.map_region()?;

    // No cycle may observe a half-registered thread.
    let _cycle = heap.cycle_lock.lock();
    let id = heap.next_thread_id();
    let mark = heap.state.mark();
    let (info, reused) = if let Some(info) = heap.threads.reuse(id, region, mark) {
        set_current(info);
        (info, true)
    } else {
        let info: &ThreadInfo = Box::leak(Box::new(ThreadInfo::new(heap, id, region, mark)));
        // The thread-local pointer comes first so a stop request sent right
        // after registration reaches the handler.
        set_current(info);
        // SAFETY: freshly leaked and unregistered.
        unsafe { heap.threads.register(NonNull::from(info)) };
        (info, false)
    };
    heap.metrics.record_attach();
    tracing::debug!(thread = id, reused, "mutator attached");

    Ok(MutatorGuard {
        heap,
        info,
        _not_send: PhantomData,
    })
}

/// Detaches the calling thread.
///
/// Detach happens between cycles: while a cycle runs the thread serves any
/// stop request addressed to it and retries once the cycle lock is free.
fn detach(heap: &Shared, info: &ThreadInfo) {
    set_current(ptr::null());
    loop {
        if let Some(_cycle) = heap.cycle_lock.try_lock_for(Duration::from_millis(1)) {
            if info
                .state
                .compare_exchange(RUNNING, DETACHED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                fatal!(
                    "thread {} detaching in state {} outside a cycle",
                    info.id(),
                    info.state()
                );
            }
            if let Some(region) = info.local_region() {
                info.set_local_region(None);
                // SAFETY: the thread no longer allocates from it.
                unsafe { heap.regions.push(region) };
            }
            break;
        }
        if info.stop_requested() {
            safepoint::serve(heap, info);
        }
    }
    tracing::debug!(thread = info.id(), "mutator detached");
}

// ============================================================================
// MutatorGuard
// ============================================================================

/// An attached mutator thread. Dropping the guard detaches the thread.
///
/// The guard is bound to the thread that created it.
pub struct MutatorGuard<'h> {
    heap: &'h Shared,
    info: &'h ThreadInfo,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for MutatorGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorGuard")
            .field("thread", &self.info.id())
            .finish_non_exhaustive()
    }
}

impl<'h> MutatorGuard<'h> {
    /// Allocates a zeroed object of `size` payload bytes in this thread's
    /// local region.
    ///
    /// Aborts the process if `size` exceeds
    /// [`LARGE_OBJECT_THRESHOLD`](crate::heap::LARGE_OBJECT_THRESHOLD).
    #[inline]
    pub fn alloc(&self, size: usize, kind: HeapKind) -> ObjectRef {
        self.heap.alloc(self.info, size, kind)
    }

    /// Serves a pending stop request, if any.
    ///
    /// Generated code calls this at loop back-edges, calls and returns.
    #[inline]
    pub fn safepoint(&self) {
        safepoint::check(self.heap, self.info);
    }

    /// Creates a shadow root holding `value`.
    ///
    /// Objects reachable from a live `Root` survive collection, and the root
    /// is updated when its object is moved.
    pub fn root(&self, value: Option<ObjectRef>) -> Root<'_> {
        Root::new(self.info, value)
    }

    /// Registry id of this thread.
    #[must_use]
    pub fn thread_id(&self) -> u64 {
        self.info.id()
    }
}

impl Drop for MutatorGuard<'_> {
    fn drop(&mut self) {
        detach(self.heap, self.info);
    }
}

// ============================================================================
// Root
// ============================================================================

/// A shadow-stack root owned by a mutator.
///
/// Native mutator code has no compiler-emitted stack maps; holding a
/// reference in a `Root` is how it keeps an object alive across safepoints.
pub struct Root<'g> {
    info: &'g ThreadInfo,
    cell: Box<AtomicPtr<u8>>,
    _not_send: PhantomData<*const ()>,
}

impl<'g> Root<'g> {
    fn new(info: &'g ThreadInfo, value: Option<ObjectRef>) -> Self {
        let cell = Box::new(AtomicPtr::new(
            value.map_or(ptr::null_mut(), ObjectRef::as_ptr),
        ));
        info.shadow_roots.lock().push(Self::slot_of(&cell));
        Self {
            info,
            cell,
            _not_send: PhantomData,
        }
    }

    fn slot_of(cell: &AtomicPtr<u8>) -> Slot {
        // SAFETY: the boxed cell is pointer-aligned and outlives its
        // registration in the shadow stack.
        unsafe { Slot::from_raw(NonNull::from(cell).cast()) }
    }

    /// Current value. Reflects moves done by the collector.
    #[must_use]
    pub fn get(&self) -> Option<ObjectRef> {
        Self::slot_of(&self.cell).load()
    }

    /// Replaces the value.
    pub fn set(&self, value: Option<ObjectRef>) {
        Self::slot_of(&self.cell).store(value);
    }
}

impl fmt::Debug for Root<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Root").field(&self.get()).finish()
    }
}

impl Drop for Root<'_> {
    fn drop(&mut self) {
        let slot = Self::slot_of(&self.cell);
        let mut roots = self.info.shadow_roots.lock();
        if let Some(index) = roots.iter().rposition(|s| *s == slot) {
            roots.swap_remove(index);
        }
    }
}

// ============================================================================
// Free functions for generated code
// ============================================================================

/// Serves a pending stop request for the calling thread. A no-op on a thread
/// that is not attached.
#[inline]
pub fn safepoint_check() {
    if let Some(info) = current() {
        // SAFETY: the entry stays valid while the thread is attached, and the
        // heap outlives it.
        let info = unsafe { info.as_ref() };
        safepoint::check(info.heap(), info);
    }
}

/// Allocates from the calling thread's local region.
///
/// # Errors
///
/// Returns [`GcError::NotAttached`] if the thread is not attached to a heap.
pub fn alloc(size: usize, kind: HeapKind) -> Result<ObjectRef, GcError> {
    let info = current().ok_or(GcError::NotAttached)?;
    // SAFETY: see `safepoint_check`.
    let info = unsafe { info.as_ref() };
    Ok(info.heap().alloc(info, size, kind))
}
