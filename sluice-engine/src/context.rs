use crate::archive::FileSource;
use crate::codec::Codec;
use crate::completion::CompletionSender;
use crate::config::StreamEngineConfig;
use crate::decompress::DecompressSender;
use crate::statistics::StreamingStatistics;
use crate::temp_memory::TempMemoryBudget;
use std::sync::Arc;

/// Everything a pipeline stage needs to move a request along, shared by all engine threads
#[derive(Clone)]
pub(crate) struct StreamContext {
    pub config: Arc<StreamEngineConfig>,
    pub source: Arc<dyn FileSource>,
    pub codec: Arc<dyn Codec>,
    pub temp_memory: TempMemoryBudget,
    pub stats: Arc<StreamingStatistics>,
    pub completion: CompletionSender,
    pub decompress: DecompressSender,
}
