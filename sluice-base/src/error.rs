/// Reason a stream failed. Once a request has an error it keeps the first one it was given.
///
/// `OutOfMemory`, `Preempted` and `Misscheduled` are transient: the scheduler resolves them by
/// requeueing and they only reach callers if a request is still stuck when the engine shuts down.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamError {
    CannotOpenFile,
    CannotStartReading,
    OffsetOutOfRange,
    SizeOutOfRange,
    OutOfMemory,
    Preempted,
    Misscheduled,
    VerificationFailed,
    DecompressionFailed,
    UserAbort,
    AbortedOnShutdown,
}

pub type StreamResult<T> = Result<T, StreamError>;

impl StreamError {
    /// Stable non-zero numeric code. Zero is reserved for "no error" so the code can live in an
    /// atomic.
    pub fn code(self) -> u32 {
        match self {
            StreamError::CannotOpenFile => 1,
            StreamError::CannotStartReading => 2,
            StreamError::OffsetOutOfRange => 3,
            StreamError::SizeOutOfRange => 4,
            StreamError::OutOfMemory => 5,
            StreamError::Preempted => 6,
            StreamError::Misscheduled => 7,
            StreamError::VerificationFailed => 8,
            StreamError::DecompressionFailed => 9,
            StreamError::UserAbort => 10,
            StreamError::AbortedOnShutdown => 11,
        }
    }

    pub fn from_code(code: u32) -> Option<StreamError> {
        match code {
            1 => Some(StreamError::CannotOpenFile),
            2 => Some(StreamError::CannotStartReading),
            3 => Some(StreamError::OffsetOutOfRange),
            4 => Some(StreamError::SizeOutOfRange),
            5 => Some(StreamError::OutOfMemory),
            6 => Some(StreamError::Preempted),
            7 => Some(StreamError::Misscheduled),
            8 => Some(StreamError::VerificationFailed),
            9 => Some(StreamError::DecompressionFailed),
            10 => Some(StreamError::UserAbort),
            11 => Some(StreamError::AbortedOnShutdown),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamError::CannotOpenFile => "CannotOpenFile",
            StreamError::CannotStartReading => "CannotStartReading",
            StreamError::OffsetOutOfRange => "OffsetOutOfRange",
            StreamError::SizeOutOfRange => "SizeOutOfRange",
            StreamError::OutOfMemory => "OutOfMemory",
            StreamError::Preempted => "Preempted",
            StreamError::Misscheduled => "Misscheduled",
            StreamError::VerificationFailed => "VerificationFailed",
            StreamError::DecompressionFailed => "DecompressionFailed",
            StreamError::UserAbort => "UserAbort",
            StreamError::AbortedOnShutdown => "AbortedOnShutdown",
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            StreamError::OutOfMemory | StreamError::Preempted | StreamError::Misscheduled
        )
    }
}

impl std::error::Error for StreamError {}

impl core::fmt::Display for StreamError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        self.name().fmt(fmt)
    }
}
