use serde::{Deserialize, Serialize};

/// Kind of asset a stream is loading. Used to route completions, pause streaming selectively and
/// to bucket statistics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamTaskType {
    Animation,
    Geometry,
    Sound,
    Texture,
    Shader,
    Terrain,
    Video,
    Flash,
    Pak,
    GeomCache,
    MergedMesh,
    Music,
}

/// Mask covering every task type
pub const ALL_TASK_TYPES_MASK: u32 = (1 << StreamTaskType::COUNT as u32) - 1;

/// Mask covering the task types that feed the audio system
pub const AUDIO_TASK_TYPES_MASK: u32 =
    StreamTaskType::Sound.mask() | StreamTaskType::Music.mask();

impl StreamTaskType {
    pub const COUNT: usize = 12;

    pub const ALL: [StreamTaskType; StreamTaskType::COUNT] = [
        StreamTaskType::Animation,
        StreamTaskType::Geometry,
        StreamTaskType::Sound,
        StreamTaskType::Texture,
        StreamTaskType::Shader,
        StreamTaskType::Terrain,
        StreamTaskType::Video,
        StreamTaskType::Flash,
        StreamTaskType::Pak,
        StreamTaskType::GeomCache,
        StreamTaskType::MergedMesh,
        StreamTaskType::Music,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn mask(self) -> u32 {
        1 << (self as u32)
    }

    pub fn from_index(index: usize) -> Option<StreamTaskType> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamTaskType::Animation => "Animation",
            StreamTaskType::Geometry => "Geometry",
            StreamTaskType::Sound => "Sound",
            StreamTaskType::Texture => "Texture",
            StreamTaskType::Shader => "Shader",
            StreamTaskType::Terrain => "Terrain",
            StreamTaskType::Video => "Video",
            StreamTaskType::Flash => "Flash",
            StreamTaskType::Pak => "Pak",
            StreamTaskType::GeomCache => "GeomCache",
            StreamTaskType::MergedMesh => "MergedMesh",
            StreamTaskType::Music => "Music",
        }
    }

    pub fn is_in_mask(
        self,
        mask: u32,
    ) -> bool {
        (mask & self.mask()) != 0
    }
}

impl std::fmt::Display for StreamTaskType {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
