//! Bounded MPMC ring with four cache-line isolated cursors.
//!
//! The protocol is the classic two-phase head/tail scheme: a producer first
//! claims slots by advancing `prod_head` (CAS in multi-producer mode) and
//! writes them, then publishes by advancing `prod_tail`. In multi-producer
//! mode the publish waits for any earlier claimant to publish first, keeping
//! commits FIFO. Consumers mirror the same dance on `cons_head` and
//! `cons_tail`. No operation blocks or allocates; a full (or empty) ring is
//! reported through the returned count.

use core::mem::{align_of, size_of};
use core::ptr;

use crate::mem::MemView;
use crate::sync::{AtomicU32, Ordering, spin_loop};

/// Threading mode for one side of a ring.
///
/// A `Single` side elides the head CAS and the FIFO commit wait; it is only
/// sound when exactly one thread ever drives that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Single,
    Multi,
}

/// Ring metadata: one cache line of configuration, one per cursor.
#[repr(C)]
pub struct RingHeader {
    /// Slot count (power of two, immutable after init).
    pub capacity: u32,
    /// `capacity - 1`, immutable after init.
    pub mask: u32,
    prod_single: u32,
    cons_single: u32,
    _pad0: [u8; 48],

    prod_head: AtomicU32,
    _pad1: [u8; 60],
    prod_tail: AtomicU32,
    _pad2: [u8; 60],
    cons_head: AtomicU32,
    _pad3: [u8; 60],
    cons_tail: AtomicU32,
    _pad4: [u8; 60],
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<RingHeader>() == 320);

impl RingHeader {
    /// Initialize a ring header in place.
    pub fn init(&mut self, capacity: u32, prod: SyncMode, cons: SyncMode) {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        self.capacity = capacity;
        self.mask = capacity - 1;
        self.prod_single = (prod == SyncMode::Single) as u32;
        self.cons_single = (cons == SyncMode::Single) as u32;
        self._pad0 = [0; 48];
        self.prod_head = AtomicU32::new(0);
        self._pad1 = [0; 60];
        self.prod_tail = AtomicU32::new(0);
        self._pad2 = [0; 60];
        self.cons_head = AtomicU32::new(0);
        self._pad3 = [0; 60];
        self.cons_tail = AtomicU32::new(0);
        self._pad4 = [0; 60];
    }
}

/// Byte footprint of a ring with the given element size and capacity,
/// rounded up to a whole cache line.
///
/// Returns `None` when `capacity` is not a power of two.
pub const fn ring_bytes(element_size: usize, capacity: u32) -> Option<usize> {
    if !capacity.is_power_of_two() {
        return None;
    }
    let raw = size_of::<RingHeader>() + element_size * capacity as usize;
    Some((raw + 63) & !63)
}

/// Cursor snapshot, for diagnostics. Cursors are read independently, so the
/// snapshot is only exact on a quiescent ring.
#[derive(Debug, Clone, Copy)]
pub struct RingStatus {
    pub prod_head: u32,
    pub prod_tail: u32,
    pub cons_head: u32,
    pub cons_tail: u32,
    pub capacity: u32,
}

/// A bounded FIFO over `capacity` elements of `T` living in a [`MemView`].
///
/// Storage immediately follows the header. Elements are `Copy` and moved by
/// value; the ring never interprets them.
pub struct Ring<T> {
    /// Held to keep the backing mapping reachable; all access goes through
    /// the raw pointers below.
    #[allow(dead_code)]
    view: MemView,
    header: *mut RingHeader,
    entries: *mut T,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// Initialize a new ring at `header_offset` in the view.
    ///
    /// # Safety
    ///
    /// The mapping must be writable and exclusively owned during
    /// initialization; no other thread or process may touch the ring until
    /// this returns.
    pub unsafe fn init(
        view: MemView,
        header_offset: usize,
        capacity: u32,
        prod: SyncMode,
        cons: SyncMode,
    ) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "ring capacity must be a power of two"
        );
        assert!(align_of::<T>() <= 64, "element alignment must be <= 64");

        let entries_offset = header_offset + size_of::<RingHeader>();
        view.check_span(header_offset, size_of::<RingHeader>(), 64)
            .expect("ring header span out of bounds");
        view.check_span(
            entries_offset,
            capacity as usize * size_of::<T>(),
            align_of::<T>(),
        )
        .expect("ring entries span out of bounds");

        let header = view.typed_at::<RingHeader>(header_offset).as_ptr();
        let entries = view.typed_at::<T>(entries_offset).as_ptr();

        unsafe { (*header).init(capacity, prod, cons) };

        Self {
            view,
            header,
            entries,
        }
    }

    /// Attach to a ring previously initialized at `header_offset`.
    ///
    /// # Safety
    ///
    /// The view must contain a valid, initialized ring header at the given
    /// offset (typically written by the peer process).
    pub unsafe fn attach(view: MemView, header_offset: usize) -> Self {
        assert!(align_of::<T>() <= 64, "element alignment must be <= 64");

        view.check_span(header_offset, size_of::<RingHeader>(), 64)
            .expect("ring header span out of bounds");
        let header = view.typed_at::<RingHeader>(header_offset).as_ptr();
        let capacity = unsafe { (*header).capacity };
        let mask = unsafe { (*header).mask };

        assert!(
            capacity.is_power_of_two() && capacity > 0 && mask == capacity - 1,
            "invalid ring header"
        );

        let entries_offset = header_offset + size_of::<RingHeader>();
        view.check_span(
            entries_offset,
            capacity as usize * size_of::<T>(),
            align_of::<T>(),
        )
        .expect("ring entries span out of bounds");
        let entries = view.typed_at::<T>(entries_offset).as_ptr();

        Self {
            view,
            header,
            entries,
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    /// Ring capacity in slots. Every slot is usable.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    /// Enqueue all of `entries`, or nothing.
    ///
    /// Returns `entries.len()` on success, 0 when the ring lacks space.
    pub fn enqueue_bulk(&self, entries: &[T]) -> u32 {
        self.do_enqueue(entries, true)
    }

    /// Enqueue as many of `entries` as fit.
    ///
    /// Returns the number enqueued (possibly 0).
    pub fn enqueue_burst(&self, entries: &[T]) -> u32 {
        self.do_enqueue(entries, false)
    }

    /// Dequeue exactly `out.len()` elements, or nothing.
    pub fn dequeue_bulk(&self, out: &mut [T]) -> u32 {
        self.do_dequeue(out, true)
    }

    /// Dequeue up to `out.len()` elements.
    pub fn dequeue_burst(&self, out: &mut [T]) -> u32 {
        self.do_dequeue(out, false)
    }

    fn do_enqueue(&self, entries: &[T], fixed: bool) -> u32 {
        let n = entries.len() as u32;
        if n == 0 {
            return 0;
        }

        let header = self.header();
        let capacity = header.capacity;
        let mask = header.mask;
        let single = header.prod_single != 0;

        // Phase 1: claim [old_head, old_head + take).
        let mut old_head = header.prod_head.load(Ordering::Relaxed);
        let take;
        loop {
            // Acquire pairs with the consumer's release on cons_tail: slots
            // it has vacated are fully read before we overwrite them.
            let cons_tail = header.cons_tail.load(Ordering::Acquire);
            let free = capacity.wrapping_sub(old_head.wrapping_sub(cons_tail));
            let want = if free >= n {
                n
            } else if fixed {
                0
            } else {
                free
            };
            if want == 0 {
                return 0;
            }

            if single {
                header
                    .prod_head
                    .store(old_head.wrapping_add(want), Ordering::Relaxed);
                take = want;
                break;
            }
            match header.prod_head.compare_exchange_weak(
                old_head,
                old_head.wrapping_add(want),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    take = want;
                    break;
                }
                Err(actual) => {
                    old_head = actual;
                    spin_loop();
                }
            }
        }

        // Phase 2: fill the claimed slots.
        for i in 0..take {
            let slot = (old_head.wrapping_add(i) & mask) as usize;
            unsafe { ptr::write(self.entries.add(slot), entries[i as usize]) };
        }

        // Phase 3: publish. An earlier claimant must publish first so the
        // consumer observes commits in claim order.
        if !single {
            while header.prod_tail.load(Ordering::Acquire) != old_head {
                spin_loop();
            }
        }
        header
            .prod_tail
            .store(old_head.wrapping_add(take), Ordering::Release);

        take
    }

    fn do_dequeue(&self, out: &mut [T], fixed: bool) -> u32 {
        let n = out.len() as u32;
        if n == 0 {
            return 0;
        }

        let header = self.header();
        let mask = header.mask;
        let single = header.cons_single != 0;

        let mut old_head = header.cons_head.load(Ordering::Relaxed);
        let take;
        loop {
            // Acquire pairs with the producer's release on prod_tail: the
            // slot contents are visible before we read them.
            let prod_tail = header.prod_tail.load(Ordering::Acquire);
            let avail = prod_tail.wrapping_sub(old_head);
            let want = if avail >= n {
                n
            } else if fixed {
                0
            } else {
                avail
            };
            if want == 0 {
                return 0;
            }

            if single {
                header
                    .cons_head
                    .store(old_head.wrapping_add(want), Ordering::Relaxed);
                take = want;
                break;
            }
            match header.cons_head.compare_exchange_weak(
                old_head,
                old_head.wrapping_add(want),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    take = want;
                    break;
                }
                Err(actual) => {
                    old_head = actual;
                    spin_loop();
                }
            }
        }

        for i in 0..take {
            let slot = (old_head.wrapping_add(i) & mask) as usize;
            out[i as usize] = unsafe { ptr::read(self.entries.add(slot)) };
        }

        if !single {
            while header.cons_tail.load(Ordering::Acquire) != old_head {
                spin_loop();
            }
        }
        // Release pairs with the producer's acquire on cons_tail.
        header
            .cons_tail
            .store(old_head.wrapping_add(take), Ordering::Release);

        take
    }

    /// Number of committed elements waiting to be consumed (approximate
    /// under concurrency).
    pub fn len(&self) -> u32 {
        let header = self.header();
        let prod_tail = header.prod_tail.load(Ordering::Acquire);
        let cons_tail = header.cons_tail.load(Ordering::Acquire);
        prod_tail.wrapping_sub(cons_tail).min(header.capacity)
    }

    /// Returns true if no committed elements are waiting.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots a producer could still claim (approximate under
    /// concurrency).
    pub fn free_space(&self) -> u32 {
        let header = self.header();
        let prod_head = header.prod_head.load(Ordering::Acquire);
        let cons_tail = header.cons_tail.load(Ordering::Acquire);
        header
            .capacity
            .wrapping_sub(prod_head.wrapping_sub(cons_tail))
            .min(header.capacity)
    }

    /// Cursor snapshot for diagnostics.
    pub fn status(&self) -> RingStatus {
        let header = self.header();
        RingStatus {
            prod_head: header.prod_head.load(Ordering::Acquire),
            prod_tail: header.prod_tail.load(Ordering::Acquire),
            cons_head: header.cons_head.load(Ordering::Acquire),
            cons_tail: header.cons_tail.load(Ordering::Acquire),
            capacity: header.capacity,
        }
    }
}
