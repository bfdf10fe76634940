//! Shared-memory dataplane channels.
//!
//! A channel is a single named shared region that one engine process and
//! one application process map into their address spaces. Inside it live a
//! control ring pair (submissions and completions), two data rings (one per
//! direction), a free-buffer ring, and a pool of fixed-size message frames
//! addressed by 32-bit index.
//!
//! The region is self-describing: a header at offset zero carries the
//! layout, and its magic word is published with full fences as the very
//! last initialization step, so a peer can safely poll for readiness.
//!
//! # Engine side
//!
//! ```ignore
//! use skein_channel::{ChannelConfig, ChannelManager};
//!
//! let manager = ChannelManager::new();
//! let channel = manager.add_channel("app-0", &ChannelConfig::default())?;
//!
//! let mut indices = [0u32; 32];
//! let n = channel.alloc_msgbuf_bulk(&mut indices[..16]);
//! // fill frames, then hand them to the application:
//! channel.enqueue_messages_to_app(&indices[..n as usize]);
//! ```
//!
//! # Application side
//!
//! ```ignore
//! use skein_channel::Channel;
//!
//! let channel = Channel::attach("app-0")?; // retry while Err(NotReady)
//! let mut indices = [0u32; 32];
//! let n = channel.dequeue_messages_from_engine(&mut indices);
//! for &index in &indices[..n as usize] {
//!     let frame = channel.msg_buf(index);
//!     // consume frame.data(), then recycle:
//!     channel.free_msgbuf(index);
//! }
//! ```

pub mod channel;
pub mod ctrl;
pub mod layout;
pub mod manager;
pub mod msgbuf;

pub use channel::{AttachError, Channel, CreateError, FREE_RETRY_LIMIT};
pub use ctrl::{CtrlQueueEntry, opcode, opcode_name, status};
pub use layout::{
    CTRL_CQ_SLOTS, CTRL_SQ_SLOTS, ChannelConfig, ChannelHeader, ChannelLayout, ChannelStats,
    DEFAULT_BUF_SLOTS, DEFAULT_BUFFER_SIZE, DEFAULT_RING_SLOTS, HEADER_SIZE, LayoutError, MAGIC,
    NAME_LEN, STATS_SIZE, VERSION,
};
pub use manager::{AddChannelError, ChannelManager, MAX_CHANNELS};
pub use msgbuf::{
    FlowInfo, INVALID_BUF_INDEX, MSGBUF_HEADROOM_MAX, MSGBUF_MAGIC, MSGBUF_RESERVED, MsgBuf, flags,
};
