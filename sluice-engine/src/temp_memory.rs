use crossbeam_channel::{Receiver, Sender};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct TempMemoryInner {
    budget: usize,
    pool_capacity: usize,
    allocated: AtomicUsize,
    pool_used: AtomicUsize,
    interval_peak: AtomicUsize,
    max_allocated: AtomicUsize,
    out_of_budget: AtomicBool,
    wake_events: Mutex<Vec<Sender<()>>>,
}

impl TempMemoryInner {
    fn free(
        &self,
        accounted: usize,
        from_pool: bool,
    ) {
        if from_pool {
            self.pool_used.fetch_sub(accounted, Ordering::AcqRel);
        }
        self.allocated.fetch_sub(accounted, Ordering::AcqRel);

        // Anyone that failed an allocation gets a chance to retry
        for wake_event in &*self.wake_events.lock().unwrap() {
            let _ = wake_event.try_send(());
        }
    }

    fn try_reserve_pool(
        &self,
        size: usize,
    ) -> bool {
        let mut used = self.pool_used.load(Ordering::Acquire);
        loop {
            if used + size > self.pool_capacity {
                return false;
            }

            match self.pool_used.compare_exchange_weak(
                used,
                used + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }
}

/// Budget-tracked allocator for the transient buffers used while streaming (read scratch,
/// decompression output, codec state).
///
/// Allocations are served from a bounded pool first. When the pool is exhausted they may fall back
/// to the general heap, but only if the allocation is urgent, nothing else is live, or the live
/// total stays within the budget. Every free wakes the registered wake events so that IO threads
/// waiting on memory can retry.
#[derive(Clone)]
pub struct TempMemoryBudget {
    inner: Arc<TempMemoryInner>,
}

impl TempMemoryBudget {
    pub fn new(
        budget: usize,
        pool_capacity: usize,
    ) -> Self {
        TempMemoryBudget {
            inner: Arc::new(TempMemoryInner {
                budget,
                pool_capacity,
                allocated: AtomicUsize::new(0),
                pool_used: AtomicUsize::new(0),
                interval_peak: AtomicUsize::new(0),
                max_allocated: AtomicUsize::new(0),
                out_of_budget: AtomicBool::new(false),
                wake_events: Mutex::new(Vec::default()),
            }),
        }
    }

    /// Returns `None` when the pool is exhausted and falling back to the heap is not permitted.
    ///
    /// Blocks are byte buffers, so `align` only rounds up the size charged against the budget.
    pub fn temp_alloc(
        &self,
        size: usize,
        urgent: bool,
        fallback_allowed: bool,
        align: usize,
    ) -> Option<TempBlock> {
        profiling::scope!("TempMemoryBudget::temp_alloc");
        let align = align.max(1);
        let accounted = (size + align - 1) / align * align;

        let from_pool = if self.inner.try_reserve_pool(accounted) {
            true
        } else {
            if !fallback_allowed {
                return None;
            }

            let live = self.inner.allocated.load(Ordering::Acquire);
            if !(urgent || live == 0 || live + accounted <= self.inner.budget) {
                self.inner.out_of_budget.store(true, Ordering::Release);
                log::trace!(
                    "Temporary allocation of {} bytes refused, {} of {} bytes live",
                    accounted,
                    live,
                    self.inner.budget
                );
                return None;
            }

            false
        };

        let live = self.inner.allocated.fetch_add(accounted, Ordering::AcqRel) + accounted;
        self.inner.interval_peak.fetch_max(live, Ordering::AcqRel);
        self.inner.max_allocated.fetch_max(live, Ordering::AcqRel);

        Some(TempBlock {
            data: vec![0u8; size],
            accounted,
            from_pool,
            owner: self.inner.clone(),
        })
    }

    /// Frees the block. Equivalent to dropping it.
    pub fn temp_free(
        &self,
        block: TempBlock,
    ) {
        drop(block);
    }

    /// Registers a new wake event. The receiver gets a message after every free, coalesced so that
    /// at most one is pending at a time.
    pub fn register_wake_event(&self) -> Receiver<()> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        self.inner.wake_events.lock().unwrap().push(wake_tx);
        wake_rx
    }

    pub fn budget(&self) -> usize {
        self.inner.budget
    }

    pub fn pool_capacity(&self) -> usize {
        self.inner.pool_capacity
    }

    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    pub fn pool_used(&self) -> usize {
        self.inner.pool_used.load(Ordering::Acquire)
    }

    pub fn max_allocated(&self) -> usize {
        self.inner.max_allocated.load(Ordering::Acquire)
    }

    /// Peak usage since the previous call. The next interval starts at the current usage.
    pub fn take_interval_peak(&self) -> usize {
        let current = self.allocated();
        self.inner.interval_peak.swap(current, Ordering::AcqRel)
    }

    /// Whether an allocation was refused since the previous call
    pub fn take_out_of_budget(&self) -> bool {
        self.inner.out_of_budget.swap(false, Ordering::AcqRel)
    }
}

/// A buffer charged against a [`TempMemoryBudget`]. The charge is released when the block drops.
pub struct TempBlock {
    data: Vec<u8>,
    accounted: usize,
    from_pool: bool,
    owner: Arc<TempMemoryInner>,
}

impl TempBlock {
    pub fn is_from_pool(&self) -> bool {
        self.from_pool
    }

    /// Replaces the contiguous storage with separately owned pages of `page_size` bytes. The
    /// budget charge stays with this block, which is empty afterwards.
    pub(crate) fn take_pages(
        &mut self,
        page_size: usize,
    ) -> Vec<Vec<u8>> {
        let len = self.data.len();
        self.data = Vec::new();
        (0..len)
            .step_by(page_size.max(1))
            .map(|begin| vec![0u8; page_size.min(len - begin)])
            .collect()
    }
}

impl Deref for TempBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for TempBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for TempBlock {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TempBlock")
            .field("len", &self.data.len())
            .field("from_pool", &self.from_pool)
            .finish()
    }
}

impl Drop for TempBlock {
    fn drop(&mut self) {
        self.owner.free(self.accounted, self.from_pool);
    }
}
