//! Channel Pipeline
//!
//! An ordered list of named handlers through which every event of a channel
//! flows. Upstream events visit handlers front to back, downstream requests
//! visit them back to front and finally reach the channel sink.
//!
//! ```text
//!                     ┌──────────────────────────┐
//!   socket ──read──>  │ "framer"   (upstream)    │  ──┐
//!                     │ "decoder"  (upstream)    │    │ upstream
//!                     │ "encoder"  (downstream)  │    │ (front → back)
//!                     │ "handler"  (upstream)    │  <─┘
//!                     └──────────────────────────┘
//!                                  │ write()
//!                                  ▼ downstream (back → front)
//!                         "encoder" → sink → worker → socket
//! ```
//!
//! ## Dynamic Modification
//!
//! Handlers may be added, removed or replaced at any time, including from
//! inside a handler that is processing an event. Each event hop resolves the
//! next handler against the live list, so an event that is already past a
//! handler keeps travelling even if that handler is removed mid-flight.
//!
//! ## Failure Handling
//!
//! A handler that returns an error or panics never unwinds into the worker.
//! The failure becomes an [`ExceptionEvent`](crate::channel::ExceptionEvent)
//! sent on from the failing handler's position. A failure while handling an
//! exception is only logged, so exceptions can never loop.

use crate::channel::event::{ChannelEvent, ExceptionEvent};
use crate::channel::handler::ChannelHandler;
use crate::channel::sink::ChannelSink;
use crate::error::{Cause, ErrorCategory, NetError, NetResult};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, error, trace, warn};

/// Creates a fresh pipeline for every new channel.
pub trait ChannelPipelineFactory: Send + Sync + 'static {
    fn get_pipeline(&self) -> NetResult<ChannelPipeline>;
}

impl<F> ChannelPipelineFactory for F
where
    F: Fn() -> NetResult<ChannelPipeline> + Send + Sync + 'static,
{
    fn get_pipeline(&self) -> NetResult<ChannelPipeline> {
        self()
    }
}

/// A factory that hands out copies of a template pipeline.
///
/// The copies share handler instances, so only stateless (or internally
/// synchronized) handlers belong in a template.
pub struct StaticPipelineFactory {
    template: ChannelPipeline,
}

impl StaticPipelineFactory {
    pub fn new(template: ChannelPipeline) -> Self {
        Self { template }
    }
}

impl ChannelPipelineFactory for StaticPipelineFactory {
    fn get_pipeline(&self) -> NetResult<ChannelPipeline> {
        Ok(self.template.duplicate())
    }
}

#[derive(Clone)]
struct Entry {
    id: u64,
    name: Arc<str>,
    handler: ChannelHandler,
}

struct PipelineInner {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    sink: OnceLock<Arc<dyn ChannelSink>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upstream,
    Downstream,
}

/// An ordered chain of named handlers attached to one channel.
///
/// Cloning is cheap and yields a handle to the same pipeline.
#[derive(Clone)]
pub struct ChannelPipeline {
    inner: Arc<PipelineInner>,
}

impl Default for ChannelPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPipeline {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sink: OnceLock::new(),
            }),
        }
    }

    /// A new, unattached pipeline holding the same handlers in the same order.
    pub fn duplicate(&self) -> ChannelPipeline {
        let copy = ChannelPipeline::new();
        {
            let entries = self.inner.entries.lock().unwrap();
            let mut target = copy.inner.entries.lock().unwrap();
            for entry in entries.iter() {
                target.push(Entry {
                    id: copy.inner.next_id.fetch_add(1, Ordering::Relaxed),
                    name: entry.name.clone(),
                    handler: entry.handler.clone(),
                });
            }
        }
        copy
    }

    // ========================================================================
    // Modification
    // ========================================================================

    pub fn add_first(&self, name: impl Into<String>, handler: ChannelHandler) -> NetResult<()> {
        let entry = self.new_entry(name.into(), handler);
        let mut entries = self.inner.entries.lock().unwrap();
        ensure_unique(&entries, &entry.name)?;
        entries.insert(0, entry);
        Ok(())
    }

    pub fn add_last(&self, name: impl Into<String>, handler: ChannelHandler) -> NetResult<()> {
        let entry = self.new_entry(name.into(), handler);
        let mut entries = self.inner.entries.lock().unwrap();
        ensure_unique(&entries, &entry.name)?;
        entries.push(entry);
        Ok(())
    }

    pub fn add_before(
        &self,
        base: &str,
        name: impl Into<String>,
        handler: ChannelHandler,
    ) -> NetResult<()> {
        let entry = self.new_entry(name.into(), handler);
        let mut entries = self.inner.entries.lock().unwrap();
        let index = position(&entries, base)?;
        ensure_unique(&entries, &entry.name)?;
        entries.insert(index, entry);
        Ok(())
    }

    pub fn add_after(
        &self,
        base: &str,
        name: impl Into<String>,
        handler: ChannelHandler,
    ) -> NetResult<()> {
        let entry = self.new_entry(name.into(), handler);
        let mut entries = self.inner.entries.lock().unwrap();
        let index = position(&entries, base)?;
        ensure_unique(&entries, &entry.name)?;
        entries.insert(index + 1, entry);
        Ok(())
    }

    /// Removes the handler registered under `name` and returns it.
    pub fn remove(&self, name: &str) -> NetResult<ChannelHandler> {
        let mut entries = self.inner.entries.lock().unwrap();
        let index = position(&entries, name)?;
        Ok(entries.remove(index).handler)
    }

    /// Replaces the handler registered under `old` and returns it.
    pub fn replace(
        &self,
        old: &str,
        new_name: impl Into<String>,
        handler: ChannelHandler,
    ) -> NetResult<ChannelHandler> {
        let entry = self.new_entry(new_name.into(), handler);
        let mut entries = self.inner.entries.lock().unwrap();
        let index = position(&entries, old)?;
        if *entry.name != *old {
            ensure_unique(&entries, &entry.name)?;
        }
        Ok(std::mem::replace(&mut entries[index], entry).handler)
    }

    fn new_entry(&self, name: String, handler: ChannelHandler) -> Entry {
        Entry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            handler,
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn get(&self, name: &str) -> Option<ChannelHandler> {
        let entries = self.inner.entries.lock().unwrap();
        entries
            .iter()
            .find(|e| &*e.name == name)
            .map(|e| e.handler.clone())
    }

    /// Returns the handler registered under `name` if it is a `H`.
    pub fn get_as<H: Any + Send + Sync>(&self, name: &str) -> Option<Arc<H>> {
        self.get(name).and_then(|h| h.downcast::<H>())
    }

    /// Returns the first handler of type `H`.
    pub fn find<H: Any + Send + Sync>(&self) -> Option<Arc<H>> {
        let entries = self.inner.entries.lock().unwrap();
        entries.iter().find_map(|e| e.handler.downcast::<H>())
    }

    pub fn first(&self) -> Option<ChannelHandler> {
        let entries = self.inner.entries.lock().unwrap();
        entries.first().map(|e| e.handler.clone())
    }

    pub fn last(&self) -> Option<ChannelHandler> {
        let entries = self.inner.entries.lock().unwrap();
        entries.last().map(|e| e.handler.clone())
    }

    /// Handler names in pipeline order.
    pub fn names(&self) -> Vec<String> {
        let entries = self.inner.entries.lock().unwrap();
        entries.iter().map(|e| e.name.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Sink
    // ========================================================================

    /// Attaches the sink that receives downstream events leaving the
    /// pipeline. A pipeline can be attached only once.
    pub fn attach(&self, sink: Arc<dyn ChannelSink>) -> NetResult<()> {
        self.inner.sink.set(sink).map_err(|_| {
            NetError::IllegalState("pipeline is already attached to a sink".to_string())
        })
    }

    pub fn is_attached(&self) -> bool {
        self.inner.sink.get().is_some()
    }

    pub fn sink(&self) -> Option<Arc<dyn ChannelSink>> {
        self.inner.sink.get().cloned()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Sends an event to the first upstream handler.
    pub fn send_upstream(&self, event: ChannelEvent) {
        match self.next_context(None, Direction::Upstream) {
            Some(ctx) => ctx.invoke_upstream(event),
            None => trace!(event = ?event, "Upstream event reached the end of the pipeline"),
        }
    }

    /// Sends a request to the last downstream handler, or to the sink if
    /// there is none.
    pub fn send_downstream(&self, event: ChannelEvent) {
        match self.next_context(None, Direction::Downstream) {
            Some(ctx) => ctx.invoke_downstream(event),
            None => self.sink_event(event),
        }
    }

    fn sink_event(&self, event: ChannelEvent) {
        // Exceptions raised on the way down are reported to the application
        if let ChannelEvent::Exception(e) = event {
            self.send_upstream(ChannelEvent::Exception(e));
            return;
        }

        let Some(sink) = self.sink() else {
            warn!(event = ?event, "Downstream event sent to a detached pipeline");
            let _ = event.future().set_failure(NetError::NotAttached);
            return;
        };

        let channel = event.channel().clone();
        let future = event.future().clone();
        if let Err(err) = sink.event_sunk(self, event) {
            let cause: Cause = Arc::new(err);
            let _ = future.set_failure(cause.clone());
            self.send_upstream(ChannelEvent::exception(&channel, cause));
        }
    }

    /// Resolves the next handler for `direction`, starting after `from`.
    fn next_context(
        &self,
        from: Option<&ChannelHandlerContext>,
        direction: Direction,
    ) -> Option<ChannelHandlerContext> {
        let entries = self.inner.entries.lock().unwrap();

        // Index of the first entry to consider, inclusive
        let start = match from {
            None => match direction {
                Direction::Upstream => Some(0),
                Direction::Downstream => entries.len().checked_sub(1),
            },
            Some(ctx) => match entries.iter().position(|e| e.id == ctx.id) {
                Some(index) => match direction {
                    Direction::Upstream => Some(index + 1),
                    Direction::Downstream => index.checked_sub(1),
                },
                None => ctx.surviving_neighbor(&entries, direction),
            },
        }?;

        let accepts = |e: &&Entry| match direction {
            Direction::Upstream => e.handler.handles_upstream(),
            Direction::Downstream => e.handler.handles_downstream(),
        };
        let entry = match direction {
            Direction::Upstream => entries.get(start..)?.iter().find(accepts),
            Direction::Downstream => entries.get(..=start)?.iter().rev().find(accepts),
        }?;

        Some(ChannelHandlerContext {
            pipeline: self.clone(),
            id: entry.id,
            name: entry.name.clone(),
            handler: entry.handler.clone(),
            snapshot: entries.iter().map(|e| e.id).collect(),
        })
    }

    fn is_last_entry(&self, id: u64) -> bool {
        let entries = self.inner.entries.lock().unwrap();
        entries.last().is_some_and(|e| e.id == id)
    }
}

fn position(entries: &[Entry], name: &str) -> NetResult<usize> {
    entries
        .iter()
        .position(|e| &*e.name == name)
        .ok_or_else(|| NetError::NoSuchHandler(name.to_string()))
}

fn ensure_unique(entries: &[Entry], name: &str) -> NetResult<()> {
    if entries.iter().any(|e| &*e.name == name) {
        return Err(NetError::DuplicateHandler(name.to_string()));
    }
    Ok(())
}

impl fmt::Debug for ChannelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPipeline")
            .field("handlers", &self.names())
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// A handler's position in a pipeline, handed to it with every event.
///
/// The context is how a handler forwards events: `send_upstream` and
/// `send_downstream` deliver to the next handler in that direction.
pub struct ChannelHandlerContext {
    pipeline: ChannelPipeline,
    id: u64,
    name: Arc<str>,
    handler: ChannelHandler,
    /// Entry ids at the time this context was resolved
    snapshot: Vec<u64>,
}

impl ChannelHandlerContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &ChannelPipeline {
        &self.pipeline
    }

    pub fn handler(&self) -> &ChannelHandler {
        &self.handler
    }

    /// Returns true if this handler is currently the last in the pipeline.
    pub fn is_last(&self) -> bool {
        self.pipeline.is_last_entry(self.id)
    }

    /// Forwards an event to the next upstream handler.
    pub fn send_upstream(&self, event: ChannelEvent) {
        match self.pipeline.next_context(Some(self), Direction::Upstream) {
            Some(next) => next.invoke_upstream(event),
            None => trace!(event = ?event, "Upstream event reached the end of the pipeline"),
        }
    }

    /// Forwards a request to the next downstream handler, or to the sink.
    pub fn send_downstream(&self, event: ChannelEvent) {
        match self.pipeline.next_context(Some(self), Direction::Downstream) {
            Some(next) => next.invoke_downstream(event),
            None => self.pipeline.sink_event(event),
        }
    }

    /// Finds where to continue when this handler was removed mid-flight:
    /// the first entry from the snapshot, past this one in `direction`,
    /// that is still in the pipeline.
    fn surviving_neighbor(&self, entries: &[Entry], direction: Direction) -> Option<usize> {
        let here = self.snapshot.iter().position(|id| *id == self.id)?;
        let present = |id: &u64| entries.iter().position(|e| e.id == *id);
        match direction {
            Direction::Upstream => self.snapshot[here + 1..].iter().find_map(present),
            Direction::Downstream => self.snapshot[..here].iter().rev().find_map(present),
        }
    }

    fn invoke_upstream(self, event: ChannelEvent) {
        let Some(handler) = self.handler.upstream_handler().cloned() else {
            return;
        };
        let channel = event.channel().clone();
        let was_exception = event.is_exception();

        if let Err(err) = guard(|| handler.handle_upstream(&self, event)) {
            if was_exception {
                error!(
                    channel = %channel.id(),
                    handler = %self.name,
                    error = %err,
                    "Handler failed while processing an exception event"
                );
                return;
            }
            log_failure(&self.name, &err);
            self.send_upstream(ChannelEvent::exception(&channel, err));
        }
    }

    fn invoke_downstream(self, event: ChannelEvent) {
        let Some(handler) = self.handler.downstream_handler().cloned() else {
            return;
        };
        let channel = event.channel().clone();
        let future = event.future().clone();
        let was_exception = event.is_exception();

        if let Err(err) = guard(|| handler.handle_downstream(&self, event)) {
            let cause: Cause = Arc::new(err);
            let _ = future.set_failure(cause.clone());
            if was_exception {
                error!(
                    channel = %channel.id(),
                    handler = %self.name,
                    error = %cause,
                    "Handler failed while processing an exception event"
                );
                return;
            }
            log_failure(&self.name, &cause);
            self.send_downstream(ChannelEvent::Exception(ExceptionEvent {
                future: channel.succeeded_future(),
                channel,
                cause,
            }));
        }
    }
}

/// Runs handler code, turning a panic into [`NetError::HandlerPanic`].
fn guard<F>(f: F) -> NetResult<()>
where
    F: FnOnce() -> NetResult<()>,
{
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|panic| Err(NetError::HandlerPanic(panic_message(panic.as_ref()))))
}

fn log_failure(handler: &str, err: &NetError) {
    match err.category() {
        ErrorCategory::Programming => error!(handler, error = %err, "Handler raised an exception"),
        _ => debug!(handler, error = %err, "Handler raised an exception"),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel::{Channel, ChannelId};
    use crate::channel::event::{MessageEvent, StateChange};
    use crate::channel::future::ChannelFuture;
    use crate::channel::handler::{DownstreamHandler, SimpleChannelHandler, UpstreamHandler};
    use crate::channel::sink::ChannelSink;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every upstream event it sees, then forwards it.
    struct Recorder {
        tag: &'static str,
        log: Log,
    }

    impl UpstreamHandler for Recorder {
        fn handle_upstream(
            &self,
            ctx: &ChannelHandlerContext,
            event: ChannelEvent,
        ) -> NetResult<()> {
            let entry = match &event {
                ChannelEvent::Message(e) => format!(
                    "{}:{}",
                    self.tag,
                    e.message_ref::<&str>().copied().unwrap_or("?")
                ),
                ChannelEvent::Exception(e) => format!("{}:exception:{}", self.tag, e.cause),
                other => format!("{}:{:?}", self.tag, other.future().is_done()),
            };
            self.log.lock().unwrap().push(entry);
            ctx.send_upstream(event);
            Ok(())
        }
    }

    /// Tags outbound messages with its name.
    struct Tagger(&'static str);

    impl DownstreamHandler for Tagger {
        fn handle_downstream(
            &self,
            ctx: &ChannelHandlerContext,
            event: ChannelEvent,
        ) -> NetResult<()> {
            match event {
                ChannelEvent::Message(e) => {
                    let text = e.message_ref::<String>().cloned().unwrap_or_default();
                    ctx.send_downstream(e.with_message(format!("{}{}", text, self.0)).into());
                }
                other => ctx.send_downstream(other),
            }
            Ok(())
        }
    }

    /// Records what reaches the end of the downstream path.
    #[derive(Default)]
    struct RecordingSink {
        written: Mutex<Vec<String>>,
    }

    impl ChannelSink for RecordingSink {
        fn event_sunk(&self, _pipeline: &ChannelPipeline, event: ChannelEvent) -> NetResult<()> {
            if let ChannelEvent::Message(e) = event {
                let text = e.message_ref::<String>().cloned().unwrap_or_default();
                self.written.lock().unwrap().push(text);
                e.future.set_success()?;
            }
            Ok(())
        }
    }

    fn channel_with(pipeline: ChannelPipeline, sink: Arc<dyn ChannelSink>) -> Channel {
        Channel::new(ChannelId::new(1), None, pipeline, sink, None, Default::default()).unwrap()
    }

    fn recorder(tag: &'static str, log: &Log) -> ChannelHandler {
        ChannelHandler::upstream(Recorder {
            tag,
            log: log.clone(),
        })
    }

    #[test]
    fn test_names_and_ordering() {
        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline.add_last("b", recorder("b", &log)).unwrap();
        pipeline.add_first("a", recorder("a", &log)).unwrap();
        pipeline.add_last("d", recorder("d", &log)).unwrap();
        pipeline.add_before("d", "c", recorder("c", &log)).unwrap();
        pipeline.add_after("d", "e", recorder("e", &log)).unwrap();
        assert_eq!(pipeline.names(), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(pipeline.len(), 5);
    }

    #[test]
    fn test_duplicate_and_missing_names() {
        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline.add_last("a", recorder("a", &log)).unwrap();

        assert!(matches!(
            pipeline.add_last("a", recorder("x", &log)),
            Err(NetError::DuplicateHandler(name)) if name == "a"
        ));
        assert!(matches!(
            pipeline.add_before("zz", "b", recorder("b", &log)),
            Err(NetError::NoSuchHandler(name)) if name == "zz"
        ));
        assert!(matches!(pipeline.remove("zz"), Err(NetError::NoSuchHandler(_))));
        assert_eq!(pipeline.names(), vec!["a"]);
    }

    #[test]
    fn test_replace_and_lookup() {
        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline.add_last("a", recorder("a", &log)).unwrap();
        pipeline
            .add_last("tag", ChannelHandler::downstream(Tagger("!")))
            .unwrap();

        assert!(pipeline.get_as::<Tagger>("tag").is_some());
        assert!(pipeline.get_as::<Recorder>("tag").is_none());
        assert!(pipeline.find::<Recorder>().is_some());

        pipeline
            .replace("tag", "tag2", ChannelHandler::downstream(Tagger("?")))
            .unwrap();
        assert_eq!(pipeline.names(), vec!["a", "tag2"]);

        // Replacing with the same name is allowed
        pipeline
            .replace("tag2", "tag2", ChannelHandler::downstream(Tagger("#")))
            .unwrap();
        assert_eq!(pipeline.get_as::<Tagger>("tag2").unwrap().0, "#");
    }

    #[test]
    fn test_upstream_order() {
        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline.add_last("a", recorder("a", &log)).unwrap();
        pipeline
            .add_last("down", ChannelHandler::downstream(Tagger("!")))
            .unwrap();
        pipeline.add_last("b", recorder("b", &log)).unwrap();
        let channel = channel_with(pipeline.clone(), Arc::new(RecordingSink::default()));

        pipeline.send_upstream(ChannelEvent::message(&channel, "hi", None));
        assert_eq!(*log.lock().unwrap(), vec!["a:hi", "b:hi"]);
    }

    #[test]
    fn test_downstream_order_reaches_sink() {
        let pipeline = ChannelPipeline::new();
        pipeline
            .add_last("first", ChannelHandler::downstream(Tagger("1")))
            .unwrap();
        pipeline
            .add_last("second", ChannelHandler::downstream(Tagger("2")))
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let channel = channel_with(pipeline, sink.clone());

        let future = channel.write(String::from("x"));
        assert!(future.is_success());
        // Back to front: "second" runs before "first"
        assert_eq!(*sink.written.lock().unwrap(), vec!["x21"]);
    }

    #[test]
    fn test_detached_pipeline_fails_future() {
        let pipeline = ChannelPipeline::new();
        let channel = channel_with(ChannelPipeline::new(), Arc::new(RecordingSink::default()));
        let future = ChannelFuture::for_channel(&channel, false);

        pipeline.send_downstream(ChannelEvent::Message(MessageEvent::new(
            channel.clone(),
            future.clone(),
            Box::new(String::from("x")),
            None,
        )));
        assert!(matches!(*future.cause().unwrap(), NetError::NotAttached));
    }

    #[test]
    fn test_attach_only_once() {
        let pipeline = ChannelPipeline::new();
        pipeline.attach(Arc::new(RecordingSink::default())).unwrap();
        assert!(pipeline.attach(Arc::new(RecordingSink::default())).is_err());
    }

    /// Removes itself (and optionally a neighbor) while handling an event.
    struct SelfRemover {
        also: Option<&'static str>,
    }

    impl UpstreamHandler for SelfRemover {
        fn handle_upstream(
            &self,
            ctx: &ChannelHandlerContext,
            event: ChannelEvent,
        ) -> NetResult<()> {
            ctx.pipeline().remove(ctx.name())?;
            if let Some(name) = self.also {
                ctx.pipeline().remove(name)?;
            }
            ctx.send_upstream(event);
            Ok(())
        }
    }

    #[test]
    fn test_removal_during_dispatch() {
        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline.add_last("a", recorder("a", &log)).unwrap();
        pipeline
            .add_last("remover", ChannelHandler::upstream(SelfRemover { also: None }))
            .unwrap();
        pipeline.add_last("c", recorder("c", &log)).unwrap();
        let channel = channel_with(pipeline.clone(), Arc::new(RecordingSink::default()));

        pipeline.send_upstream(ChannelEvent::message(&channel, "one", None));
        pipeline.send_upstream(ChannelEvent::message(&channel, "two", None));

        assert_eq!(pipeline.names(), vec!["a", "c"]);
        assert_eq!(*log.lock().unwrap(), vec!["a:one", "c:one", "a:two", "c:two"]);
    }

    #[test]
    fn test_removal_of_successor_during_dispatch() {
        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline
            .add_last(
                "remover",
                ChannelHandler::upstream(SelfRemover { also: Some("b") }),
            )
            .unwrap();
        pipeline.add_last("b", recorder("b", &log)).unwrap();
        pipeline.add_last("c", recorder("c", &log)).unwrap();
        let channel = channel_with(pipeline.clone(), Arc::new(RecordingSink::default()));

        pipeline.send_upstream(ChannelEvent::message(&channel, "one", None));
        assert_eq!(*log.lock().unwrap(), vec!["c:one"]);
    }

    struct Failing;

    impl SimpleChannelHandler for Failing {
        fn message_received(
            &self,
            _ctx: &ChannelHandlerContext,
            _e: MessageEvent,
        ) -> NetResult<()> {
            Err(NetError::CorruptedStream("bad input".into()))
        }
    }

    struct Panicking;

    impl SimpleChannelHandler for Panicking {
        fn message_received(
            &self,
            _ctx: &ChannelHandlerContext,
            _e: MessageEvent,
        ) -> NetResult<()> {
            panic!("handler bug");
        }
    }

    #[test]
    fn test_handler_error_becomes_exception_event() {
        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline.add_last("before", recorder("before", &log)).unwrap();
        pipeline
            .add_last("failing", ChannelHandler::upstream(Failing))
            .unwrap();
        pipeline.add_last("after", recorder("after", &log)).unwrap();
        let channel = channel_with(pipeline.clone(), Arc::new(RecordingSink::default()));

        pipeline.send_upstream(ChannelEvent::message(&channel, "x", None));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before:x".to_string(),
                "after:exception:corrupted stream: bad input".to_string()
            ]
        );
    }

    #[test]
    fn test_handler_panic_becomes_exception_event() {
        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline
            .add_last("panicking", ChannelHandler::upstream(Panicking))
            .unwrap();
        pipeline.add_last("after", recorder("after", &log)).unwrap();
        let channel = channel_with(pipeline.clone(), Arc::new(RecordingSink::default()));

        pipeline.send_upstream(ChannelEvent::message(&channel, "x", None));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["after:exception:handler panicked: handler bug"]
        );
    }

    struct FailingEncoder;

    impl DownstreamHandler for FailingEncoder {
        fn handle_downstream(
            &self,
            _ctx: &ChannelHandlerContext,
            _event: ChannelEvent,
        ) -> NetResult<()> {
            Err(NetError::UnsupportedMessage("String"))
        }
    }

    #[test]
    fn test_downstream_failure_fails_future_and_reports_upstream() {
        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline.add_last("log", recorder("log", &log)).unwrap();
        pipeline
            .add_last("encoder", ChannelHandler::downstream(FailingEncoder))
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let channel = channel_with(pipeline, sink.clone());

        let future = channel.write(42u32);
        assert!(matches!(
            *future.cause().unwrap(),
            NetError::UnsupportedMessage(_)
        ));
        assert!(sink.written.lock().unwrap().is_empty());
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(log.lock().unwrap()[0].starts_with("log:exception:"));
    }

    #[test]
    fn test_duplicate_shares_handlers_but_not_sink() {
        let log = Log::default();
        let template = ChannelPipeline::new();
        template.add_last("a", recorder("a", &log)).unwrap();
        template.attach(Arc::new(RecordingSink::default())).unwrap();

        let copy = template.duplicate();
        assert_eq!(copy.names(), vec!["a"]);
        assert!(!copy.is_attached());
        assert!(copy.get("a").unwrap().same_instance(&template.get("a").unwrap()));
    }

    #[test]
    fn test_state_events_pass_through_simple_handlers() {
        struct Quiet;
        impl SimpleChannelHandler for Quiet {}

        let log = Log::default();
        let pipeline = ChannelPipeline::new();
        pipeline.add_last("quiet", ChannelHandler::upstream(Quiet)).unwrap();
        pipeline.add_last("log", recorder("log", &log)).unwrap();
        let channel = channel_with(pipeline.clone(), Arc::new(RecordingSink::default()));

        pipeline.send_upstream(ChannelEvent::state(&channel, StateChange::Open(true)));
        pipeline.send_upstream(ChannelEvent::state(&channel, StateChange::InterestOps(1)));
        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
