//! Intrusive lock-free stack shared by the region list, the thread registry
//! and the reference queue.

use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam::utils::Backoff;

use crate::error::fatal;

/// A node that carries its own `next` link.
pub(crate) trait Linked: Sized {
    fn link(&self) -> &AtomicPtr<Self>;
}

/// Bounds a compare-and-swap retry loop.
///
/// Contention is expected to be short; a loop that keeps failing indicates a
/// logic bug and aborts.
pub(crate) struct RetryGuard {
    what: &'static str,
    limit: u32,
    attempts: u32,
    backoff: Backoff,
}

impl RetryGuard {
    pub(crate) fn new(what: &'static str, limit: u32) -> Self {
        Self {
            what,
            limit,
            attempts: 0,
            backoff: Backoff::new(),
        }
    }

    /// Records a failed attempt and backs off.
    pub(crate) fn retry(&mut self) {
        self.attempts += 1;
        if self.attempts >= self.limit {
            fatal!(
                "{}: compare-and-swap failed {} times in a row",
                self.what,
                self.attempts
            );
        }
        self.backoff.spin();
    }
}

/// Treiber stack over [`Linked`] nodes.
///
/// Any thread may push. Popping single nodes is restricted to one consumer at
/// a time, which rules out ABA: only the consumer removes nodes, so a head it
/// observed cannot be freed and re-pushed behind its back.
pub(crate) struct TreiberStack<T: Linked> {
    head: AtomicPtr<T>,
    what: &'static str,
    retry_limit: u32,
}

impl<T: Linked> TreiberStack<T> {
    pub(crate) const fn new(what: &'static str, retry_limit: u32) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            what,
            retry_limit,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Pushes a node.
    ///
    /// # Safety
    ///
    /// `node` must be valid, not currently on any stack, and stay valid while
    /// it is reachable from this stack.
    pub(crate) unsafe fn push(&self, node: NonNull<T>) {
        let mut guard = RetryGuard::new(self.what, self.retry_limit);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: the caller owns `node` until the CAS below publishes it.
            unsafe { node.as_ref() }.link().store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => {
                    head = current;
                    guard.retry();
                }
            }
        }
    }

    /// Pops one node.
    ///
    /// # Safety
    ///
    /// At most one thread may pop (or [`take_all`](Self::take_all)) at a time.
    pub(crate) unsafe fn pop(&self) -> Option<NonNull<T>> {
        let mut guard = RetryGuard::new(self.what, self.retry_limit);
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let node = NonNull::new(head)?;
            // SAFETY: only the single consumer unlinks nodes, so `node` is
            // still on the stack and alive.
            let next = unsafe { node.as_ref() }.link().load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(node),
                Err(current) => {
                    head = current;
                    guard.retry();
                }
            }
        }
    }

    /// Detaches the whole chain, leaving the stack empty.
    pub(crate) fn take_all(&self) -> Chain<T> {
        Chain {
            next: self.head.swap(ptr::null_mut(), Ordering::AcqRel),
        }
    }

    /// Iterates without removing anything.
    ///
    /// Sound only for stacks whose nodes are never freed while the stack is
    /// shared (the thread registry).
    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head.load(Ordering::SeqCst),
            _stack: PhantomData,
        }
    }
}

/// A chain detached by [`TreiberStack::take_all`], walked front to back.
pub(crate) struct Chain<T: Linked> {
    next: *mut T,
}

impl<T: Linked> Iterator for Chain<T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        let node = NonNull::new(self.next)?;
        // SAFETY: the chain is exclusively ours after `take_all`; the link is
        // read before the caller gets a chance to free or re-link the node.
        self.next = unsafe { node.as_ref() }.link().load(Ordering::Acquire);
        Some(node)
    }
}

pub(crate) struct Iter<'a, T: Linked> {
    next: *mut T,
    _stack: PhantomData<&'a TreiberStack<T>>,
}

impl<'a, T: Linked + 'a> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        // SAFETY: nodes of an iterated stack outlive the stack borrow.
        let node = unsafe { self.next.as_ref() }?;
        self.next = node.link().load(Ordering::Acquire);
        Some(node)
    }
}
