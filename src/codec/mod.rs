//! Codec Module
//!
//! Handlers that turn the raw byte stream of a channel into application
//! messages and back.
//!
//! - [`FrameDecoder`] + [`Decoder`]: reassembles frames from fragmented reads
//! - [`DelimiterBasedFrameDecoder`]: frames end with a delimiter (lines, NUL)
//! - [`FixedLengthFrameDecoder`]: every frame has the same size
//! - [`LengthFieldFrameDecoder`] / [`LengthFieldPrepender`]: 4-byte
//!   big-endian length header
//! - [`StringDecoder`] / [`StringEncoder`]: UTF-8 text

pub mod delimiter;
pub mod fixed_length;
pub mod frame;
pub mod length_field;
pub mod string;

// Re-export commonly used types
pub use delimiter::{DelimiterBasedFrameDecoder, Delimiters};
pub use fixed_length::FixedLengthFrameDecoder;
pub use frame::{decode_frames, Decoder, FrameDecoder};
pub use length_field::{LengthFieldFrameDecoder, LengthFieldPrepender};
pub use string::{StringDecoder, StringEncoder};

#[cfg(test)]
pub(crate) mod testing {
    //! A channel without a transport, for driving codec pipelines by hand.

    use crate::buffer::ChannelBuffer;
    use crate::channel::event::into_bytes;
    use crate::channel::{
        Channel, ChannelEvent, ChannelHandler, ChannelHandlerContext, ChannelId, ChannelPipeline,
        ChannelSink, StateChange, UpstreamHandler,
    };
    use crate::error::{Cause, NetError, NetResult};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    enum Received {
        Bytes(Vec<u8>),
        Text(String),
    }

    /// Last handler of the pipeline; records what reaches it.
    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<Received>>,
        errors: Mutex<Vec<Cause>>,
        states: Mutex<Vec<String>>,
    }

    impl UpstreamHandler for Collector {
        fn handle_upstream(&self, _ctx: &ChannelHandlerContext, event: ChannelEvent) -> NetResult<()> {
            match event {
                ChannelEvent::Message(e) => {
                    let received = if let Some(buffer) = e.message_ref::<ChannelBuffer>() {
                        Received::Bytes(buffer.as_readable().to_vec())
                    } else if let Some(text) = e.message_ref::<String>() {
                        Received::Text(text.clone())
                    } else {
                        Received::Text("<unknown>".to_string())
                    };
                    self.frames.lock().unwrap().push(received);
                }
                ChannelEvent::Exception(e) => self.errors.lock().unwrap().push(e.cause),
                ChannelEvent::State(e) => {
                    let name = match e.change {
                        StateChange::Open(true) => "OPEN",
                        StateChange::Open(false) => "CLOSED",
                        StateChange::Bound(Some(_)) => "BOUND",
                        StateChange::Bound(None) => "UNBOUND",
                        StateChange::Connected(Some(_)) => "CONNECTED",
                        StateChange::Connected(None) => "DISCONNECTED",
                        StateChange::InterestOps(_) => "INTEREST_CHANGED",
                    };
                    self.states.lock().unwrap().push(name.to_string());
                }
                ChannelEvent::ChildState(_) => {}
            }
            Ok(())
        }
    }

    /// Records written bytes and completes requests in place.
    #[derive(Default)]
    struct CaptureSink {
        written: Mutex<Vec<Bytes>>,
    }

    impl ChannelSink for CaptureSink {
        fn event_sunk(&self, _pipeline: &ChannelPipeline, event: ChannelEvent) -> NetResult<()> {
            match event {
                ChannelEvent::Message(e) => {
                    let data = into_bytes(e.message)
                        .map_err(|_| NetError::UnsupportedMessage("bytes"))?;
                    self.written.lock().unwrap().push(data);
                    e.future.set_success()?;
                }
                ChannelEvent::State(e) => {
                    e.future.set_success()?;
                    if e.change == StateChange::Open(false) {
                        if let Some(prior) = e.channel.set_closed() {
                            e.channel.fire_close_sequence(prior);
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        }
    }

    pub(crate) struct Harness {
        pub(crate) channel: Channel,
        collector: Arc<Collector>,
        sink: Arc<CaptureSink>,
    }

    impl Harness {
        /// A connected channel whose pipeline is `handlers` followed by a
        /// collector.
        pub(crate) fn new(handlers: Vec<(&'static str, ChannelHandler)>) -> Self {
            let pipeline = ChannelPipeline::new();
            for (name, handler) in handlers {
                pipeline.add_last(name, handler).unwrap();
            }
            let collector = Arc::new(Collector::default());
            pipeline
                .add_last("collector", ChannelHandler::shared_upstream(collector.clone()))
                .unwrap();

            let sink = Arc::new(CaptureSink::default());
            let channel = Channel::new(
                ChannelId::new(1),
                None,
                pipeline,
                sink.clone(),
                None,
                Default::default(),
            )
            .unwrap();
            channel.set_bound();
            channel.set_connected();
            Self {
                channel,
                collector,
                sink,
            }
        }

        /// Delivers `bytes` as one socket read.
        pub(crate) fn feed(&self, bytes: &[u8]) {
            self.channel.pipeline().send_upstream(ChannelEvent::message(
                &self.channel,
                ChannelBuffer::from(bytes),
                None,
            ));
        }

        pub(crate) fn disconnect(&self) {
            self.channel.close().wait().unwrap();
        }

        /// Every message that reached the end, as text.
        pub(crate) fn frames(&self) -> Vec<String> {
            self.collector
                .frames
                .lock()
                .unwrap()
                .iter()
                .map(|frame| match frame {
                    Received::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    Received::Text(text) => text.clone(),
                })
                .collect()
        }

        pub(crate) fn frame_bytes(&self) -> Vec<Vec<u8>> {
            self.collector
                .frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|frame| match frame {
                    Received::Bytes(bytes) => Some(bytes.clone()),
                    Received::Text(_) => None,
                })
                .collect()
        }

        /// Messages that arrived as `String`.
        pub(crate) fn strings(&self) -> Vec<String> {
            self.collector
                .frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|frame| match frame {
                    Received::Text(text) => Some(text.clone()),
                    Received::Bytes(_) => None,
                })
                .collect()
        }

        pub(crate) fn errors(&self) -> Vec<Cause> {
            self.collector.errors.lock().unwrap().clone()
        }

        pub(crate) fn states(&self) -> Vec<String> {
            self.collector.states.lock().unwrap().clone()
        }

        pub(crate) fn written(&self) -> Vec<Bytes> {
            self.sink.written.lock().unwrap().clone()
        }
    }
}
