//! Sink of connected socket channels.
//!
//! Translates downstream requests into tasks for the channel's worker:
//!
//! | Request                         | Task            |
//! |---------------------------------|-----------------|
//! | close / unbind / disconnect     | `Close`         |
//! | connect(addr)                   | `Connect`       |
//! | set interest ops                | `SetInterestOps`|
//! | write(bytes)                    | `Write`         |

use crate::channel::event::into_bytes;
use crate::channel::{
    ChannelEvent, ChannelPipeline, ChannelSink, MessageEvent, StateChange, StateEvent,
};
use crate::error::{NetError, NetResult};
use crate::transport::worker::Task;

pub(crate) struct SocketSink;

impl ChannelSink for SocketSink {
    fn event_sunk(&self, _pipeline: &ChannelPipeline, event: ChannelEvent) -> NetResult<()> {
        let Some(worker) = event.channel().worker().cloned() else {
            return Err(NetError::IllegalState(
                "socket channel is not owned by a worker".to_string(),
            ));
        };

        match event {
            ChannelEvent::State(StateEvent {
                channel,
                future,
                change,
            }) => match change {
                StateChange::Open(false) | StateChange::Bound(None) | StateChange::Connected(None) => {
                    worker.execute(Task::Close { channel, future })
                }
                StateChange::Connected(Some(remote)) => worker.execute(Task::Connect {
                    channel,
                    remote,
                    future,
                }),
                StateChange::InterestOps(ops) => worker.execute(Task::SetInterestOps {
                    channel,
                    ops,
                    future,
                }),
                StateChange::Bound(Some(_)) => {
                    return Err(NetError::Unsupported("binding a socket channel"));
                }
                StateChange::Open(true) => {
                    let _ = future.set_success();
                }
            },
            ChannelEvent::Message(MessageEvent {
                channel,
                future,
                message,
                ..
            }) => match into_bytes(message) {
                Ok(data) => worker.execute(Task::Write {
                    channel,
                    data,
                    future,
                }),
                Err(_) => {
                    return Err(NetError::UnsupportedMessage(
                        "ChannelBuffer, Bytes, Vec<u8> or String",
                    ));
                }
            },
            ChannelEvent::Exception(_) | ChannelEvent::ChildState(_) => {}
        }
        Ok(())
    }
}
