use serde::{Deserialize, Serialize};

/// Storage medium a file is read from. Each medium gets its own IO thread so that a slow optical
/// drive never stalls reads from the hard drive or from memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Hdd,
    Disc,
    Memory,
    Unknown,
}

impl MediaType {
    pub fn name(self) -> &'static str {
        match self {
            MediaType::Hdd => "HDD",
            MediaType::Disc => "Disc",
            MediaType::Memory => "Memory",
            MediaType::Unknown => "Unknown",
        }
    }

    // Compact form so a classification can be cached in an atomic
    pub fn to_u8(self) -> u8 {
        match self {
            MediaType::Hdd => 1,
            MediaType::Disc => 2,
            MediaType::Memory => 3,
            MediaType::Unknown => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<MediaType> {
        match value {
            1 => Some(MediaType::Hdd),
            2 => Some(MediaType::Disc),
            3 => Some(MediaType::Memory),
            4 => Some(MediaType::Unknown),
            _ => None,
        }
    }
}
