//! The global list of full regions.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::region::Region;
use crate::lockfree::TreiberStack;

/// Lock-free list of regions handed over by mutators (and by the copy
/// phase). Only the collector takes regions off it.
pub(crate) struct RegionList {
    stack: TreiberStack<Region>,
    len: AtomicUsize,
}

impl RegionList {
    pub(crate) const fn new(retry_limit: u32) -> Self {
        Self {
            stack: TreiberStack::new("global region list", retry_limit),
            len: AtomicUsize::new(0),
        }
    }

    /// Hands a region over to the collector.
    ///
    /// # Safety
    ///
    /// The caller must own `region` and never allocate from it again.
    pub(crate) unsafe fn push(&self, region: NonNull<Region>) {
        self.len.fetch_add(1, Ordering::Relaxed);
        // SAFETY: forwarded from the caller.
        unsafe { self.stack.push(region) };
    }

    /// Takes every region off the list. Regions pushed afterwards land on a
    /// fresh list and are left for the next cycle.
    pub(crate) fn take_all(&self) -> Vec<NonNull<Region>> {
        let regions: Vec<_> = self.stack.take_all().collect();
        self.len.fetch_sub(regions.len(), Ordering::Relaxed);
        regions
    }

    /// Approximate number of regions on the list.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concurrent_handover() {
        let list = Arc::new(RegionList::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for _ in 0..8 {
                        let region = Region::allocate().expect("map region");
                        unsafe { list.push(region) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(list.len(), 32);
        let regions = list.take_all();
        assert_eq!(regions.len(), 32);
        assert_eq!(list.len(), 0);
        for region in regions {
            unsafe { Region::release(region) }.expect("unmap region");
        }
    }
}
