//! The channel: a named shared region hosting the control ring pair, both
//! data rings, the free-buffer ring, and the buffer pool.
//!
//! The engine creates channels; applications attach, by name for POSIX
//! backed regions or by descriptor for huge-page regions. Both sides then
//! drive the same non-blocking batched operations: the free-buffer ring is
//! the single source of truth for frame ownership, and a frame belongs to
//! whoever last dequeued its index from any ring.

use std::io;
use std::os::fd::{OwnedFd, RawFd};

use skein_primitives::{Backing, HUGE_PAGE_SIZE, Ring, ShmRegion, SyncMode, page_size};

use crate::ctrl::CtrlQueueEntry;
use crate::layout::{
    CTRL_CQ_SLOTS, CTRL_SQ_SLOTS, ChannelConfig, ChannelHeader, ChannelLayout, ChannelStats,
    HEADER_SIZE, LayoutError, MAGIC, STATS_SIZE, VERSION,
};
use crate::msgbuf::MsgBuf;

/// Retries a free operation absorbs before declaring its buffers leaked.
/// Covers the worst-case commit-order wait among concurrent free-ring
/// producers.
pub const FREE_RETRY_LIMIT: u32 = 5;

/// Errors from channel creation. Any partially created backing is cleaned
/// up before these are returned.
#[derive(Debug)]
pub enum CreateError {
    /// Invalid parameters; refused before any region is allocated.
    Config(LayoutError),
    /// The kernel refused the backing region (allocation, mapping, or
    /// pinning).
    Io(io::Error),
    /// Region initialization failed after mapping.
    Init(&'static str),
}

impl From<LayoutError> for CreateError {
    fn from(e: LayoutError) -> Self {
        CreateError::Config(e)
    }
}

impl From<io::Error> for CreateError {
    fn from(e: io::Error) -> Self {
        CreateError::Io(e)
    }
}

impl std::fmt::Display for CreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateError::Config(e) => write!(f, "invalid channel parameters: {e}"),
            CreateError::Io(e) => write!(f, "I/O error: {e}"),
            CreateError::Init(msg) => write!(f, "channel initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for CreateError {}

/// Errors from attaching to a channel.
#[derive(Debug)]
pub enum AttachError {
    Io(io::Error),
    /// The header magic is zero or wrong: the creator has not published the
    /// channel yet (or never will). Retry later.
    NotReady,
    /// The header is published but inconsistent.
    BadHeader(&'static str),
}

impl From<io::Error> for AttachError {
    fn from(e: io::Error) -> Self {
        AttachError::Io(e)
    }
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachError::Io(e) => write!(f, "I/O error: {e}"),
            AttachError::NotReady => write!(f, "channel is not published yet"),
            AttachError::BadHeader(msg) => write!(f, "bad channel header: {msg}"),
        }
    }
}

impl std::error::Error for AttachError {}

/// A mapped channel: one side of an engine/application session.
///
/// Dropping a `Channel` unmaps the region; the creating side additionally
/// unlinks POSIX-named backings. Dropping is idempotent across handles: an
/// attached handle never unlinks a region it did not create.
pub struct Channel {
    name: String,
    shm: ShmRegion,
    header: *mut ChannelHeader,
    stats: *mut ChannelStats,
    ctrl_sq: Ring<CtrlQueueEntry>,
    ctrl_cq: Ring<CtrlQueueEntry>,
    engine_ring: Ring<u32>,
    app_ring: Ring<u32>,
    buf_ring: Ring<u32>,
    pool_base: *mut u8,
    frame_size: u32,
    buf_count: u32,
    buf_mss: u32,
}

unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    /// Create a new channel (engine side).
    ///
    /// Tries a huge-page backing first and falls back to POSIX named shared
    /// memory. The region is fully initialized (rings, stats, every frame's
    /// immutable header, the free ring seeded with all indices) before the
    /// magic is published.
    pub fn create(name: &str, config: &ChannelConfig) -> Result<Self, CreateError> {
        config.validate()?;
        let (shm, layout) = Self::create_backing(name, config)?;
        let view = shm.view();

        let header: *mut ChannelHeader = view.typed_at::<ChannelHeader>(0).as_ptr();
        unsafe { (*header).init(name, &layout) };

        let stats: *mut ChannelStats =
            view.typed_at::<ChannelStats>(layout.stats_offset).as_ptr();
        unsafe { (*stats).init() };

        // Control SQ: any app thread submits, one engine thread consumes.
        // Control CQ is the mirror image. Both data rings run
        // multi-producer/multi-consumer.
        let ctrl_sq = unsafe {
            Ring::init(
                view,
                layout.ctrl_sq_offset,
                CTRL_SQ_SLOTS,
                SyncMode::Multi,
                SyncMode::Single,
            )
        };
        let ctrl_cq = unsafe {
            Ring::init(
                view,
                layout.ctrl_cq_offset,
                CTRL_CQ_SLOTS,
                SyncMode::Single,
                SyncMode::Multi,
            )
        };
        let engine_ring = unsafe {
            Ring::init(
                view,
                layout.engine_ring_offset,
                config.engine_ring_slots,
                SyncMode::Multi,
                SyncMode::Multi,
            )
        };
        let app_ring = unsafe {
            Ring::init(
                view,
                layout.app_ring_offset,
                config.app_ring_slots,
                SyncMode::Multi,
                SyncMode::Multi,
            )
        };
        let buf_ring = unsafe {
            Ring::init(
                view,
                layout.buf_ring_offset,
                config.buf_ring_slots,
                SyncMode::Multi,
                SyncMode::Multi,
            )
        };

        // Stamp every frame's immutable identity.
        let stride = layout.frame_size as usize;
        let pool_base = view.block_at(layout.buf_pool_offset, stride, 0).as_ptr();
        for i in 0..layout.buf_count {
            let frame = view.block_at(layout.buf_pool_offset, stride, i).as_ptr() as *mut MsgBuf;
            unsafe { (*frame).init(i, layout.buf_mss + crate::msgbuf::MSGBUF_HEADROOM_MAX) };
        }

        // Seed the free ring with the full index set; it must swallow every
        // slot in one bulk operation.
        let indices: Vec<u32> = (0..layout.buf_count).collect();
        let enqueued = buf_ring.enqueue_bulk(&indices);
        if enqueued != layout.buf_count || buf_ring.free_space() != 0 {
            return Err(CreateError::Init("free ring population failed"));
        }

        unsafe { (*header).publish_magic() };

        tracing::debug!(
            channel = name,
            size = layout.total_size,
            backing = ?shm.backing(),
            buffers = layout.buf_count,
            "channel created"
        );

        Ok(Self {
            name: name.to_owned(),
            shm,
            header,
            stats,
            ctrl_sq,
            ctrl_cq,
            engine_ring,
            app_ring,
            buf_ring,
            pool_base,
            frame_size: layout.frame_size,
            buf_count: layout.buf_count,
            buf_mss: layout.buf_mss,
        })
    }

    fn create_backing(
        name: &str,
        config: &ChannelConfig,
    ) -> Result<(ShmRegion, ChannelLayout), CreateError> {
        match ChannelLayout::compute(config, HUGE_PAGE_SIZE) {
            Ok(layout) => {
                match ShmRegion::create_huge_page(name, layout.total_size, config.pin_memory) {
                    Ok(shm) => return Ok((shm, layout)),
                    Err(err) => tracing::debug!(
                        channel = name,
                        %err,
                        "huge-page backing unavailable, falling back to POSIX shm"
                    ),
                }
            }
            Err(err) => tracing::debug!(
                channel = name,
                %err,
                "huge-page layout rejected, falling back to POSIX shm"
            ),
        }

        let layout = ChannelLayout::compute(config, page_size())?;
        let shm = ShmRegion::create_posix(name, layout.total_size, config.pin_memory)?;
        Ok((shm, layout))
    }

    /// Attach to a POSIX named channel (application side).
    ///
    /// Returns [`AttachError::NotReady`] until the creator has published the
    /// magic; callers poll.
    pub fn attach(name: &str) -> Result<Self, AttachError> {
        let shm = ShmRegion::attach_posix(name)?;
        Self::attach_region(shm)
    }

    /// Attach through a descriptor received from the engine. This is the
    /// only way to reach a huge-page channel from another process.
    pub fn attach_fd(fd: OwnedFd) -> Result<Self, AttachError> {
        let shm = ShmRegion::attach_fd(fd)?;
        Self::attach_region(shm)
    }

    fn attach_region(shm: ShmRegion) -> Result<Self, AttachError> {
        let view = shm.view();
        if view.len() < HEADER_SIZE {
            return Err(AttachError::BadHeader("region smaller than header"));
        }

        let header: *mut ChannelHeader = view.typed_at::<ChannelHeader>(0).as_ptr();
        let header_ref = unsafe { &*header };

        match header_ref.magic.load(core::sync::atomic::Ordering::SeqCst) {
            m if m == MAGIC => {}
            _ => return Err(AttachError::NotReady),
        }
        if header_ref.version != VERSION {
            return Err(AttachError::BadHeader("unsupported version"));
        }
        if header_ref.size != view.len() as u64 {
            return Err(AttachError::BadHeader("size mismatch"));
        }

        let data = &header_ref.data_ctx;
        let pool_end = data
            .buf_pool_ofs
            .checked_add(data.buf_count as u64 * data.buf_size as u64)
            .ok_or(AttachError::BadHeader("pool overflows"))?;
        for offset in [
            data.ctrl_sq_ofs,
            data.ctrl_cq_ofs,
            data.engine_ring_ofs,
            data.app_ring_ofs,
            data.buf_ring_ofs,
        ] {
            if offset >= view.len() as u64 {
                return Err(AttachError::BadHeader("offset out of bounds"));
            }
        }
        if view
            .check_span(data.stats_ofs as usize, STATS_SIZE, 8)
            .is_err()
        {
            return Err(AttachError::BadHeader("stats block out of bounds"));
        }
        if pool_end > view.len() as u64 {
            return Err(AttachError::BadHeader("pool out of bounds"));
        }
        if data.buf_count == 0 || !data.buf_size.is_power_of_two() {
            return Err(AttachError::BadHeader("bad buffer geometry"));
        }

        let stats: *mut ChannelStats =
            view.typed_at::<ChannelStats>(data.stats_ofs as usize).as_ptr();
        let ctrl_sq = unsafe { Ring::attach(view, data.ctrl_sq_ofs as usize) };
        let ctrl_cq = unsafe { Ring::attach(view, data.ctrl_cq_ofs as usize) };
        let engine_ring = unsafe { Ring::attach(view, data.engine_ring_ofs as usize) };
        let app_ring = unsafe { Ring::attach(view, data.app_ring_ofs as usize) };
        let buf_ring = unsafe { Ring::attach(view, data.buf_ring_ofs as usize) };
        let pool_base = view
            .block_at(data.buf_pool_ofs as usize, data.buf_size as usize, 0)
            .as_ptr();

        let name = header_ref.name_str().to_owned();
        let frame_size = data.buf_size;
        let buf_count = data.buf_count;
        let buf_mss = data.buf_mss;

        tracing::debug!(channel = %name, size = view.len(), "attached to channel");

        Ok(Self {
            name,
            shm,
            header,
            stats,
            ctrl_sq,
            ctrl_cq,
            engine_ring,
            app_ring,
            buf_ring,
            pool_base,
            frame_size,
            buf_count,
            buf_mss,
        })
    }

    #[inline]
    fn header(&self) -> &ChannelHeader {
        unsafe { &*self.header }
    }

    /// The magic is immutable once published; anything else here means the
    /// header has been corrupted and continuing would corrupt memory.
    #[inline]
    fn debug_assert_magic(&self) {
        debug_assert_eq!(
            self.header().magic.load(core::sync::atomic::Ordering::Relaxed),
            MAGIC,
            "channel header magic corrupted"
        );
    }

    // ── data plane: engine side ─────────────────────────────────────────────

    /// Enqueue a batch of frame indices to the application. All-or-nothing:
    /// returns the batch size, or 0 on back-pressure.
    pub fn enqueue_messages_to_app(&self, indices: &[u32]) -> u32 {
        self.debug_assert_magic();
        let n = self.engine_ring.enqueue_bulk(indices);
        if n > 0 {
            self.stats()
                .msgs_to_app
                .fetch_add(n as u64, core::sync::atomic::Ordering::Relaxed);
        }
        n
    }

    /// Dequeue up to `out.len()` frame indices submitted by the application.
    pub fn dequeue_messages_from_app(&self, out: &mut [u32]) -> u32 {
        self.debug_assert_magic();
        self.app_ring.dequeue_burst(out)
    }

    /// Dequeue up to `out.len()` pending control requests.
    pub fn dequeue_ctrl_requests(&self, out: &mut [CtrlQueueEntry]) -> u32 {
        self.debug_assert_magic();
        self.ctrl_sq.dequeue_burst(out)
    }

    /// Post a batch of control completions. All-or-nothing.
    pub fn enqueue_ctrl_completions(&self, entries: &[CtrlQueueEntry]) -> u32 {
        self.debug_assert_magic();
        let n = self.ctrl_cq.enqueue_bulk(entries);
        if n > 0 {
            self.stats()
                .ctrl_completions
                .fetch_add(n as u64, core::sync::atomic::Ordering::Relaxed);
        }
        n
    }

    // ── data plane: application side ────────────────────────────────────────

    /// Enqueue a batch of frame indices to the engine. All-or-nothing.
    pub fn enqueue_messages_to_engine(&self, indices: &[u32]) -> u32 {
        self.debug_assert_magic();
        let n = self.app_ring.enqueue_bulk(indices);
        if n > 0 {
            self.stats()
                .msgs_to_engine
                .fetch_add(n as u64, core::sync::atomic::Ordering::Relaxed);
        }
        n
    }

    /// Dequeue up to `out.len()` frame indices sent by the engine.
    pub fn dequeue_messages_from_engine(&self, out: &mut [u32]) -> u32 {
        self.debug_assert_magic();
        self.engine_ring.dequeue_burst(out)
    }

    /// Submit one control request. Returns 1, or 0 when the SQ is full.
    pub fn enqueue_ctrl_request(&self, entry: &CtrlQueueEntry) -> u32 {
        self.debug_assert_magic();
        let n = self.ctrl_sq.enqueue_bulk(core::slice::from_ref(entry));
        if n > 0 {
            self.stats()
                .ctrl_requests
                .fetch_add(n as u64, core::sync::atomic::Ordering::Relaxed);
        }
        n
    }

    /// Dequeue up to `out.len()` control completions.
    pub fn dequeue_ctrl_completions(&self, out: &mut [CtrlQueueEntry]) -> u32 {
        self.debug_assert_magic();
        self.ctrl_cq.dequeue_burst(out)
    }

    /// Allocate the next control request id.
    #[inline]
    pub fn next_ctrl_request_id(&self) -> u64 {
        self.header().next_ctrl_request_id()
    }

    // ── buffer pool ─────────────────────────────────────────────────────────

    /// Allocate up to `out.len()` buffers. Each returned frame has been
    /// reset to the empty state. Returns the number allocated.
    pub fn alloc_msgbuf_bulk(&self, out: &mut [u32]) -> u32 {
        self.debug_assert_magic();
        let n = self.buf_ring.dequeue_burst(out);
        if n == 0 {
            if !out.is_empty() {
                self.stats()
                    .alloc_failures
                    .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            }
            return 0;
        }
        for &index in &out[..n as usize] {
            unsafe { self.msg_buf_mut(index) }.reset();
        }
        n
    }

    /// Allocate a single buffer.
    pub fn alloc_msgbuf(&self) -> Option<u32> {
        let mut index = [0u32; 1];
        (self.alloc_msgbuf_bulk(&mut index) == 1).then(|| index[0])
    }

    /// Return a batch of buffers to the pool. All-or-nothing with a bounded
    /// retry to absorb transient free-ring contention; when the retries are
    /// exhausted the buffers are counted as leaked and `false` is returned.
    pub fn free_msgbuf_bulk(&self, indices: &[u32]) -> bool {
        self.debug_assert_magic();
        if indices.is_empty() {
            return true;
        }
        debug_assert!(indices.iter().all(|&i| i < self.buf_count));

        let mut attempts = 0;
        loop {
            if self.buf_ring.enqueue_bulk(indices) != 0 {
                return true;
            }
            attempts += 1;
            if attempts > FREE_RETRY_LIMIT {
                self.stats()
                    .free_failures
                    .fetch_add(indices.len() as u64, core::sync::atomic::Ordering::Relaxed);
                tracing::warn!(
                    channel = %self.name,
                    count = indices.len(),
                    "buffer free failed after bounded retries; buffers leaked"
                );
                return false;
            }
        }
    }

    /// Return a single buffer to the pool.
    pub fn free_msgbuf(&self, index: u32) -> bool {
        self.free_msgbuf_bulk(&[index])
    }

    /// Buffers currently in the free ring. Approximate while peers allocate
    /// or free concurrently.
    #[inline]
    pub fn free_buf_count(&self) -> u32 {
        self.buf_ring.len()
    }

    /// The frame header for `index`.
    ///
    /// Panics on an out-of-range index; an index that never came from this
    /// channel's rings is a corrupted peer, and continuing would corrupt
    /// memory.
    pub fn msg_buf(&self, index: u32) -> &MsgBuf {
        assert!(
            index < self.buf_count,
            "buffer index {index} out of range (count={})",
            self.buf_count
        );
        unsafe { &*(self.pool_base.add(index as usize * self.frame_size as usize) as *const MsgBuf) }
    }

    /// Mutable access to the frame header for `index`.
    ///
    /// # Safety
    ///
    /// The caller must own the frame (it last dequeued `index` from one of
    /// the channel's rings) and must not hold another reference to it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn msg_buf_mut(&self, index: u32) -> &mut MsgBuf {
        assert!(
            index < self.buf_count,
            "buffer index {index} out of range (count={})",
            self.buf_count
        );
        unsafe { &mut *(self.pool_base.add(index as usize * self.frame_size as usize) as *mut MsgBuf) }
    }

    // ── accessors ───────────────────────────────────────────────────────────

    /// Channel name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total region size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.header().size
    }

    /// Base address of the buffer pool in this mapping, for DMA
    /// registration by the driver.
    #[inline]
    pub fn buf_pool_addr(&self) -> *mut u8 {
        self.pool_base
    }

    /// Total byte size of the buffer pool.
    #[inline]
    pub fn buf_pool_size(&self) -> usize {
        self.buf_count as usize * self.frame_size as usize
    }

    /// Number of frames in the pool.
    #[inline]
    pub fn total_buf_count(&self) -> u32 {
        self.buf_count
    }

    /// Full frame stride in bytes.
    #[inline]
    pub fn total_buf_size(&self) -> u32 {
        self.frame_size
    }

    /// Payload bytes usable by callers, headroom excluded.
    #[inline]
    pub fn usable_buf_size(&self) -> u32 {
        self.buf_mss
    }

    /// The backing descriptor, for passing to a peer or driver.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.shm.as_raw_fd()
    }

    /// Duplicate the backing descriptor.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.shm.try_clone_fd()
    }

    /// Which backing strategy the region ended up with.
    #[inline]
    pub fn backing(&self) -> Backing {
        self.shm.backing()
    }

    /// The channel counters.
    #[inline]
    pub fn stats(&self) -> &ChannelStats {
        unsafe { &*self.stats }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        tracing::debug!(channel = %self.name, "channel handle dropped");
        // ShmRegion unmaps, closes, and (creator side, POSIX) unlinks.
    }
}
