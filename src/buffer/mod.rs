//! Buffer Module
//!
//! Byte containers used everywhere a channel touches raw data: the bytes a
//! worker reads from a socket, the cumulation buffer of a frame decoder, and
//! the payload of an outbound write.
//!
//! ## Cursor Model
//!
//! ```text
//!      +-------------------+------------------+------------------+
//!      | discardable bytes |  readable bytes  |  writable bytes  |
//!      +-------------------+------------------+------------------+
//!      |                   |                  |                  |
//!      0      <=      readerIndex   <=   writerIndex    <=    capacity
//! ```
//!
//! Relative reads advance the reader index, relative writes advance the writer
//! index. Absolute `get_*`/`set_*` accessors never move either cursor, which is
//! what lets an encoder reserve a length header and patch it afterwards.

pub mod channel_buffer;

// Re-export commonly used types
pub use channel_buffer::ChannelBuffer;
