use serde::{Deserialize, Serialize};

/// Scheduling priority of a read. Variants are declared from most to least urgent, so the derived
/// ordering sorts urgent work first.
///
/// `Preempted` is assigned by the scheduler to a request that yielded to urgent work, so that it
/// resumes right after the urgent requests. Callers should not request it directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamPriority {
    Urgent,
    Preempted,
    AboveNormal,
    Normal,
    BelowNormal,
    Idle,
}

impl Default for StreamPriority {
    fn default() -> Self {
        StreamPriority::Normal
    }
}

impl StreamPriority {
    /// Position in the most-to-least urgent ordering, used as the high bits of sort keys
    pub const fn rank(self) -> u64 {
        self as u64
    }

    pub fn from_rank(rank: u64) -> Option<StreamPriority> {
        match rank {
            0 => Some(StreamPriority::Urgent),
            1 => Some(StreamPriority::Preempted),
            2 => Some(StreamPriority::AboveNormal),
            3 => Some(StreamPriority::Normal),
            4 => Some(StreamPriority::BelowNormal),
            5 => Some(StreamPriority::Idle),
            _ => None,
        }
    }

    pub fn is_urgent(self) -> bool {
        self == StreamPriority::Urgent
    }
}
