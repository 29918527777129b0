//! Channel Sinks
//!
//! The sink is the end of the downstream path. It turns requests that made
//! it through every downstream handler into transport actions: a write is
//! queued on the owning worker, a bind starts an acceptor, a close tears the
//! socket down.

use crate::channel::event::ChannelEvent;
use crate::channel::pipeline::ChannelPipeline;
use crate::error::NetResult;

/// Receives downstream events that left the pipeline.
///
/// Exception events never reach a sink; the pipeline sends them back
/// upstream instead. An error returned here fails the event's future and is
/// reported upstream as an exception.
pub trait ChannelSink: Send + Sync + 'static {
    fn event_sunk(&self, pipeline: &ChannelPipeline, event: ChannelEvent) -> NetResult<()>;
}
