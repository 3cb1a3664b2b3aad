use crate::ReadStream;
use std::sync::{Arc, RwLock};

/// Observes stream traffic, e.g. for a streaming debugger. Hooks are called from whatever thread
/// performs the step, so implementations must be cheap and thread safe.
pub trait StreamEngineListener: Send + Sync {
    fn on_stream_enqueue(
        &self,
        _stream: &ReadStream,
    ) {
    }

    fn on_stream_begin_async_callback(
        &self,
        _stream: &ReadStream,
    ) {
    }

    fn on_stream_end_async_callback(
        &self,
        _stream: &ReadStream,
    ) {
    }
}

pub(crate) type ListenerSlot = Arc<RwLock<Option<Arc<dyn StreamEngineListener>>>>;
