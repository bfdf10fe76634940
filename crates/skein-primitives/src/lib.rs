#![doc = include_str!("../README.md")]
#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod mem;
pub mod ring;
pub mod sync;

#[cfg(any(test, feature = "alloc"))]
pub use mem::HeapMem;
pub use mem::{MemView, SpanError};
pub use ring::{Ring, RingHeader, RingStatus, SyncMode, ring_bytes};

// OS-level backing for cross-process regions (requires std).
#[cfg(all(feature = "std", unix))]
pub mod shm;

#[cfg(all(feature = "std", unix))]
pub use shm::{Backing, HUGE_PAGE_SIZE, ShmRegion, page_size};

#[cfg(all(test, loom))]
mod loom_tests;
