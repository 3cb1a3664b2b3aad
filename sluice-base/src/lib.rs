pub mod hashing;

mod error;
pub use error::{StreamError, StreamResult};

mod media_type;
pub use media_type::MediaType;

mod priority;
pub use priority::StreamPriority;

mod task_type;
pub use task_type::StreamTaskType;
pub use task_type::ALL_TASK_TYPES_MASK;
pub use task_type::AUDIO_TASK_TYPES_MASK;
