pub mod archive;
pub mod codec;
pub mod config;

mod completion;
mod context;
mod decompress;
mod engine;
mod file_request;
mod io_worker;

mod listener;
pub use listener::StreamEngineListener;

mod read_stream;
pub use read_stream::{ReadFlags, ReadStream, SharedBuffer, StreamCallback, StreamReadParams};

mod statistics;
pub use statistics::{StreamingStatisticsSnapshot, TaskTypeStatistics, TempMemoryStatistics};

mod temp_memory;
pub use temp_memory::{TempBlock, TempMemoryBudget};

pub use archive::{
    DiskFileSource, EntryMetadata, FileSource, LayeredFileSource, MemoryFileSource, OpenedFile,
};
pub use codec::{Codec, CodecError, DeflateCodec, InflateProgress, InflateStatus, InflateStream};
pub use config::{StreamEngineConfig, StreamEngineConfigJson};
pub use engine::{StreamEngine, StreamReadBatchParams};

pub use sluice_base::{
    MediaType, StreamError, StreamPriority, StreamResult, StreamTaskType, ALL_TASK_TYPES_MASK,
    AUDIO_TASK_TYPES_MASK,
};

#[cfg(test)]
mod tests;
