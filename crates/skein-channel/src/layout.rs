//! Channel header, statistics block, and region layout computation.
//!
//! The layout function is the single authority on where everything lives
//! inside a channel region: sizing and initialization both derive from it,
//! so they agree bit for bit.

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use skein_primitives::ring_bytes;

use crate::ctrl::CtrlQueueEntry;
use crate::msgbuf::{MSGBUF_HEADROOM_MAX, MSGBUF_RESERVED};

/// Magic value published as the final step of channel initialization.
pub const MAGIC: u32 = u32::from_le_bytes(*b"SKC1");

/// Channel format version.
pub const VERSION: u32 = 1;

/// Channel header size in bytes.
pub const HEADER_SIZE: usize = 384;

/// Statistics block size in bytes.
pub const STATS_SIZE: usize = 64;

/// Size of the NUL-terminated channel name field.
pub const NAME_LEN: usize = 256;

/// Capacity of the control submission ring.
pub const CTRL_SQ_SLOTS: u32 = 2;

/// Capacity of the control completion ring.
pub const CTRL_CQ_SLOTS: u32 = CTRL_SQ_SLOTS;

/// Default capacity for both data rings.
pub const DEFAULT_RING_SLOTS: u32 = 256;

/// Default number of buffers in the pool.
pub const DEFAULT_BUF_SLOTS: u32 = 4096;

/// Default usable payload size per buffer.
pub const DEFAULT_BUFFER_SIZE: u32 = 4096;

/// Control-plane context embedded in the header.
#[repr(C)]
pub struct CtrlContext {
    /// Monotonic allocator for control request ids.
    pub req_id: AtomicU64,
}

/// Data-plane context embedded in the header: where everything lives and
/// how buffers are shaped. Written once at init, read-only afterwards.
#[repr(C)]
pub struct DataContext {
    /// Offset of the statistics block.
    pub stats_ofs: u64,
    /// Offset of the control submission ring.
    pub ctrl_sq_ofs: u64,
    /// Offset of the control completion ring.
    pub ctrl_cq_ofs: u64,
    /// Offset of the engine→app data ring.
    pub engine_ring_ofs: u64,
    /// Offset of the app→engine data ring.
    pub app_ring_ofs: u64,
    /// Offset of the free-buffer ring.
    pub buf_ring_ofs: u64,
    /// Offset of the buffer pool (page aligned).
    pub buf_pool_ofs: u64,
    /// Number of buffer frames in the pool.
    pub buf_count: u32,
    /// Full frame stride in bytes (power of two).
    pub buf_size: u32,
    /// Usable payload bytes per frame, headroom excluded.
    pub buf_mss: u32,
    _pad: u32,
}

/// The channel header at offset 0 of the region.
///
/// `magic` is the publication token: it stays zero while the creator
/// initializes the region and is stored, between two full fences, as the
/// very last step. A peer that reads anything other than [`MAGIC`] must
/// treat the channel as not ready.
#[repr(C)]
pub struct ChannelHeader {
    pub magic: AtomicU32,
    pub version: u32,
    /// Total region size in bytes.
    pub size: u64,
    /// Channel name, NUL-terminated.
    pub name: [u8; NAME_LEN],
    pub ctrl_ctx: CtrlContext,
    pub data_ctx: DataContext,
    /// Reserved, zero. Pads the header to a cache-line multiple so the
    /// blocks that follow stay 64-byte aligned.
    pub reserved: [u8; 32],
}

const _: () = assert!(size_of::<ChannelHeader>() == HEADER_SIZE);
const _: () = assert!(HEADER_SIZE % 64 == 0);

impl ChannelHeader {
    /// Initialize the header for a freshly created region. The magic is
    /// left at zero; call [`ChannelHeader::publish_magic`] once the rest of
    /// the region is ready.
    pub(crate) fn init(&mut self, name: &str, layout: &ChannelLayout) {
        self.magic = AtomicU32::new(0);
        self.version = VERSION;
        self.size = layout.total_size as u64;

        self.name = [0; NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN - 1);
        self.name[..n].copy_from_slice(&bytes[..n]);

        self.ctrl_ctx = CtrlContext {
            req_id: AtomicU64::new(0),
        };
        self.data_ctx = DataContext {
            stats_ofs: layout.stats_offset as u64,
            ctrl_sq_ofs: layout.ctrl_sq_offset as u64,
            ctrl_cq_ofs: layout.ctrl_cq_offset as u64,
            engine_ring_ofs: layout.engine_ring_offset as u64,
            app_ring_ofs: layout.app_ring_offset as u64,
            buf_ring_ofs: layout.buf_ring_offset as u64,
            buf_pool_ofs: layout.buf_pool_offset as u64,
            buf_count: layout.buf_count,
            buf_size: layout.frame_size,
            buf_mss: layout.buf_mss,
            _pad: 0,
        };
        self.reserved = [0; 32];
    }

    /// Publish the channel to peers. Full fences on both sides of the magic
    /// store keep a peer from ever observing a half-initialized region.
    pub(crate) fn publish_magic(&self) {
        fence(Ordering::SeqCst);
        self.magic.store(MAGIC, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Returns true once the magic has been published.
    #[inline]
    pub fn is_published(&self) -> bool {
        self.magic.load(Ordering::SeqCst) == MAGIC
    }

    /// The channel name as a string slice (empty on malformed bytes).
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN - 1);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Allocate the next control request id.
    #[inline]
    pub fn next_ctrl_request_id(&self) -> u64 {
        self.ctrl_ctx.req_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Fixed block of channel counters, right after the header.
///
/// Counters are monotonic and relaxed; they feed observability, not control
/// flow.
#[repr(C)]
pub struct ChannelStats {
    /// Messages committed to the engine→app ring.
    pub msgs_to_app: AtomicU64,
    /// Messages committed to the app→engine ring.
    pub msgs_to_engine: AtomicU64,
    /// Control requests submitted.
    pub ctrl_requests: AtomicU64,
    /// Control completions posted.
    pub ctrl_completions: AtomicU64,
    /// Bulk allocations that returned nothing.
    pub alloc_failures: AtomicU64,
    /// Buffers leaked because a free exhausted its bounded retries.
    pub free_failures: AtomicU64,
    pub reserved: [u8; 16],
}

const _: () = assert!(size_of::<ChannelStats>() == STATS_SIZE);

impl ChannelStats {
    pub(crate) fn init(&mut self) {
        self.msgs_to_app = AtomicU64::new(0);
        self.msgs_to_engine = AtomicU64::new(0);
        self.ctrl_requests = AtomicU64::new(0);
        self.ctrl_completions = AtomicU64::new(0);
        self.alloc_failures = AtomicU64::new(0);
        self.free_failures = AtomicU64::new(0);
        self.reserved = [0; 16];
    }
}

/// Parameters for creating a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Engine→app data ring capacity (power of two).
    pub engine_ring_slots: u32,
    /// App→engine data ring capacity (power of two).
    pub app_ring_slots: u32,
    /// Number of buffers in the pool, which is also the free-ring capacity
    /// (power of two).
    pub buf_ring_slots: u32,
    /// Usable payload bytes per buffer; must not exceed the backing page
    /// size.
    pub buffer_size: u32,
    /// Pin the region resident with `mlock`. Creation fails if pinning
    /// fails.
    pub pin_memory: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            engine_ring_slots: DEFAULT_RING_SLOTS,
            app_ring_slots: DEFAULT_RING_SLOTS,
            buf_ring_slots: DEFAULT_BUF_SLOTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pin_memory: true,
        }
    }
}

impl ChannelConfig {
    /// Validate everything that does not depend on the backing page size.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if !self.engine_ring_slots.is_power_of_two() {
            return Err(LayoutError::NotPowerOfTwo("engine_ring_slots"));
        }
        if !self.app_ring_slots.is_power_of_two() {
            return Err(LayoutError::NotPowerOfTwo("app_ring_slots"));
        }
        if !self.buf_ring_slots.is_power_of_two() {
            return Err(LayoutError::NotPowerOfTwo("buf_ring_slots"));
        }
        if self.buffer_size == 0 {
            return Err(LayoutError::ZeroBufferSize);
        }
        Ok(())
    }
}

/// Errors from layout computation. No region is allocated when any of these
/// is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// The named ring capacity parameter is not a power of two.
    NotPowerOfTwo(&'static str),
    /// A buffer cannot exceed the backing page size.
    BufferTooLarge { buffer_size: u32, page_size: usize },
    ZeroBufferSize,
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LayoutError::NotPowerOfTwo(what) => {
                write!(f, "{what} must be a power of two")
            }
            LayoutError::BufferTooLarge {
                buffer_size,
                page_size,
            } => write!(
                f,
                "buffer_size {buffer_size} exceeds backing page size {page_size}"
            ),
            LayoutError::ZeroBufferSize => write!(f, "buffer_size must be > 0"),
        }
    }
}

impl std::error::Error for LayoutError {}

/// Computed layout of a channel region for a given backing page size.
///
/// Equal inputs always yield equal layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Backing page size the layout was computed for.
    pub page_size: usize,
    /// Full frame stride: `next_pow2(buffer_size + reserved + headroom)`.
    pub frame_size: u32,
    /// Number of buffer frames.
    pub buf_count: u32,
    /// Usable payload bytes per frame.
    pub buf_mss: u32,
    pub stats_offset: usize,
    pub ctrl_sq_offset: usize,
    pub ctrl_cq_offset: usize,
    pub engine_ring_offset: usize,
    pub app_ring_offset: usize,
    pub buf_ring_offset: usize,
    /// Page-aligned offset of the buffer pool.
    pub buf_pool_offset: usize,
    /// Total region size, page aligned.
    pub total_size: usize,
}

impl ChannelLayout {
    /// Compute the region layout for `config` on a backing with the given
    /// page size.
    pub fn compute(config: &ChannelConfig, page_size: usize) -> Result<Self, LayoutError> {
        config.validate()?;
        if config.buffer_size as usize > page_size {
            return Err(LayoutError::BufferTooLarge {
                buffer_size: config.buffer_size,
                page_size,
            });
        }

        let frame_size =
            (config.buffer_size + MSGBUF_RESERVED + MSGBUF_HEADROOM_MAX).next_power_of_two();

        let slot = size_of::<u32>();
        let ctrl = size_of::<CtrlQueueEntry>();

        // validate() checked the capacities, so ring_bytes cannot fail.
        let stats_offset = HEADER_SIZE;
        let ctrl_sq_offset = stats_offset + STATS_SIZE;
        let ctrl_cq_offset =
            ctrl_sq_offset + ring_bytes(ctrl, CTRL_SQ_SLOTS).ok_or(LayoutError::NotPowerOfTwo("ctrl_sq_slots"))?;
        let engine_ring_offset =
            ctrl_cq_offset + ring_bytes(ctrl, CTRL_CQ_SLOTS).ok_or(LayoutError::NotPowerOfTwo("ctrl_cq_slots"))?;
        let app_ring_offset = engine_ring_offset
            + ring_bytes(slot, config.engine_ring_slots)
                .ok_or(LayoutError::NotPowerOfTwo("engine_ring_slots"))?;
        let buf_ring_offset = app_ring_offset
            + ring_bytes(slot, config.app_ring_slots)
                .ok_or(LayoutError::NotPowerOfTwo("app_ring_slots"))?;
        let rings_end = buf_ring_offset
            + ring_bytes(slot, config.buf_ring_slots)
                .ok_or(LayoutError::NotPowerOfTwo("buf_ring_slots"))?;

        let buf_pool_offset = align_up(rings_end, page_size);
        let pool_bytes = config.buf_ring_slots as usize * frame_size as usize;
        let total_size = align_up(buf_pool_offset + pool_bytes, page_size);

        Ok(Self {
            page_size,
            frame_size,
            buf_count: config.buf_ring_slots,
            buf_mss: config.buffer_size,
            stats_offset,
            ctrl_sq_offset,
            ctrl_cq_offset,
            engine_ring_offset,
            app_ring_offset,
            buf_ring_offset,
            buf_pool_offset,
            total_size,
        })
    }

    /// Byte size of the buffer pool.
    #[inline]
    pub fn buf_pool_size(&self) -> usize {
        self.buf_count as usize * self.frame_size as usize
    }
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use skein_primitives::HeapMem;

    use super::*;

    fn heap_header() -> (HeapMem, *mut ChannelHeader) {
        let heap = HeapMem::zeroed(HEADER_SIZE);
        let ptr = heap.view().typed_at::<ChannelHeader>(0).as_ptr();
        (heap, ptr)
    }

    fn small_config() -> ChannelConfig {
        ChannelConfig {
            engine_ring_slots: 256,
            app_ring_slots: 256,
            buf_ring_slots: 64,
            buffer_size: 2048,
            pin_memory: false,
        }
    }

    #[test]
    fn header_and_stats_sizes() {
        assert_eq!(size_of::<ChannelHeader>(), HEADER_SIZE);
        assert_eq!(size_of::<ChannelStats>(), STATS_SIZE);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ChannelConfig::default().validate().is_ok());
    }

    #[test]
    fn layout_is_deterministic() {
        let config = small_config();
        let a = ChannelLayout::compute(&config, 4096).unwrap();
        let b = ChannelLayout::compute(&config, 4096).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn layout_offsets_are_ordered_and_aligned() {
        let config = small_config();
        let layout = ChannelLayout::compute(&config, 4096).unwrap();

        assert_eq!(layout.stats_offset, HEADER_SIZE);
        assert!(layout.ctrl_sq_offset > layout.stats_offset);
        assert!(layout.ctrl_cq_offset > layout.ctrl_sq_offset);
        assert!(layout.engine_ring_offset > layout.ctrl_cq_offset);
        assert!(layout.app_ring_offset > layout.engine_ring_offset);
        assert!(layout.buf_ring_offset > layout.app_ring_offset);
        assert!(layout.buf_pool_offset >= layout.buf_ring_offset);
        assert!(layout.total_size >= layout.buf_pool_offset + layout.buf_pool_size());

        for offset in [
            layout.ctrl_sq_offset,
            layout.ctrl_cq_offset,
            layout.engine_ring_offset,
            layout.app_ring_offset,
            layout.buf_ring_offset,
        ] {
            assert!(offset.is_multiple_of(64), "ring offset {offset} unaligned");
        }
        assert!(layout.buf_pool_offset.is_multiple_of(4096));
        assert!(layout.total_size.is_multiple_of(4096));
    }

    #[test]
    fn frame_size_is_power_of_two_covering_payload() {
        let config = small_config();
        let layout = ChannelLayout::compute(&config, 4096).unwrap();

        assert!(layout.frame_size.is_power_of_two());
        assert!(layout.frame_size >= 2048 + MSGBUF_RESERVED + MSGBUF_HEADROOM_MAX);
        assert_eq!(layout.frame_size, 4096);
        assert_eq!(layout.buf_pool_size(), 64 * 4096);
    }

    #[test]
    fn non_power_of_two_capacities_are_rejected() {
        let mut config = small_config();
        config.buf_ring_slots = 3;
        assert_eq!(
            ChannelLayout::compute(&config, 4096),
            Err(LayoutError::NotPowerOfTwo("buf_ring_slots"))
        );

        let mut config = small_config();
        config.engine_ring_slots = 100;
        assert!(ChannelLayout::compute(&config, 4096).is_err());
    }

    #[test]
    fn buffer_size_bounded_by_page_size() {
        let mut config = small_config();
        config.buffer_size = 4096;
        assert!(ChannelLayout::compute(&config, 4096).is_ok());

        config.buffer_size = 4097;
        assert!(matches!(
            ChannelLayout::compute(&config, 4096),
            Err(LayoutError::BufferTooLarge { .. })
        ));
    }

    #[test]
    fn header_name_roundtrip_and_truncation() {
        let config = small_config();
        let layout = ChannelLayout::compute(&config, 4096).unwrap();

        let (_heap, header) = heap_header();
        let header = unsafe { &mut *header };
        header.init("dataplane-0", &layout);
        assert_eq!(header.name_str(), "dataplane-0");
        assert!(!header.is_published());

        header.publish_magic();
        assert!(header.is_published());

        let long = "n".repeat(NAME_LEN * 2);
        header.init(&long, &layout);
        assert_eq!(header.name_str().len(), NAME_LEN - 1);
    }

    #[test]
    fn request_ids_are_monotonic() {
        let config = small_config();
        let layout = ChannelLayout::compute(&config, 4096).unwrap();
        let (_heap, header) = heap_header();
        let header = unsafe { &mut *header };
        header.init("ids", &layout);

        assert_eq!(header.next_ctrl_request_id(), 1);
        assert_eq!(header.next_ctrl_request_id(), 2);
        assert_eq!(header.next_ctrl_request_id(), 3);
    }
}
