use sluice_base::hashing::HashMap;
use sluice_base::MediaType;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// What the file source knows about an entry before any of it is read
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct EntryMetadata {
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub is_compressed: bool,
    // Checksum of the uncompressed data, if the container records one
    pub crc32: Option<u32>,
    // Position of the entry on its physical medium, used to order reads by seek distance
    pub disk_offset: u64,
}

impl EntryMetadata {
    /// Number of bytes physically stored for the entry
    pub fn stored_size(&self) -> u64 {
        if self.is_compressed {
            self.compressed_size
        } else {
            self.uncompressed_size
        }
    }
}

pub trait OpenedFile: Send {
    fn metadata(&self) -> EntryMetadata;

    /// Medium the opened entry actually lives on. May differ from what the source predicted for
    /// the path, for example when an archive has been loaded into memory.
    fn media_type(&self) -> MediaType;

    /// Reads stored bytes starting at `offset` (relative to the start of the entry)
    fn read_at(
        &mut self,
        offset: u64,
        buffer: &mut [u8],
    ) -> std::io::Result<usize>;
}

/// The archive/filesystem layer the engine reads from
pub trait FileSource: Send + Sync {
    fn open_file(
        &self,
        path: &str,
    ) -> std::io::Result<Box<dyn OpenedFile>>;

    fn exists(
        &self,
        path: &str,
    ) -> bool;

    /// Predicted medium for the path, without opening it
    fn media_type(
        &self,
        path: &str,
    ) -> MediaType;

    fn file_offset_on_media(
        &self,
        _path: &str,
    ) -> u64 {
        0
    }
}

/// Fills `buffer` completely or fails
pub fn read_exact_at(
    file: &mut dyn OpenedFile,
    mut offset: u64,
    mut buffer: &mut [u8],
) -> std::io::Result<()> {
    while !buffer.is_empty() {
        let read = file.read_at(offset, buffer)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file ended before the requested range",
            ));
        }
        offset += read as u64;
        buffer = &mut buffer[read..];
    }

    Ok(())
}

//
// Loose files
//
/// Loose, uncompressed files under a root directory
pub struct DiskFileSource {
    root_path: PathBuf,
    media_type: MediaType,
}

impl DiskFileSource {
    pub fn new(root_path: PathBuf) -> Self {
        DiskFileSource {
            root_path,
            media_type: MediaType::Hdd,
        }
    }

    pub fn with_media_type(
        root_path: PathBuf,
        media_type: MediaType,
    ) -> Self {
        DiskFileSource {
            root_path,
            media_type,
        }
    }

    pub fn root_path(&self) -> &PathBuf {
        &self.root_path
    }
}

struct DiskOpenedFile {
    file: std::fs::File,
    size: u64,
    media_type: MediaType,
}

impl OpenedFile for DiskOpenedFile {
    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            compressed_size: self.size,
            uncompressed_size: self.size,
            is_compressed: false,
            crc32: None,
            disk_offset: 0,
        }
    }

    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn read_at(
        &mut self,
        offset: u64,
        buffer: &mut [u8],
    ) -> std::io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read(buffer)
    }
}

impl FileSource for DiskFileSource {
    fn open_file(
        &self,
        path: &str,
    ) -> std::io::Result<Box<dyn OpenedFile>> {
        let full_path = self.root_path.join(path);
        let file = std::fs::File::open(&full_path)?;
        let size = file.metadata()?.len();
        log::trace!("Opened {:?} ({} bytes)", full_path, size);
        Ok(Box::new(DiskOpenedFile {
            file,
            size,
            media_type: self.media_type,
        }))
    }

    fn exists(
        &self,
        path: &str,
    ) -> bool {
        self.root_path.join(path).is_file()
    }

    fn media_type(
        &self,
        _path: &str,
    ) -> MediaType {
        self.media_type
    }
}

//
// In-memory archive
//
struct MemoryEntry {
    stored: Vec<u8>,
    metadata: EntryMetadata,
}

struct MemoryArchiveContents {
    entries: HashMap<String, Arc<MemoryEntry>>,
    next_disk_offset: u64,
}

/// An archive whose entries are held in memory, stored raw or deflated. Entries are laid out one
/// after another so their disk offsets behave like a packed archive.
pub struct MemoryFileSource {
    contents: RwLock<MemoryArchiveContents>,
    resident_media_type: MediaType,
    reported_media_type: MediaType,
}

impl Default for MemoryFileSource {
    fn default() -> Self {
        MemoryFileSource::new(MediaType::Memory)
    }
}

impl MemoryFileSource {
    pub fn new(media_type: MediaType) -> Self {
        MemoryFileSource {
            contents: RwLock::new(MemoryArchiveContents {
                entries: HashMap::default(),
                next_disk_offset: 0,
            }),
            resident_media_type: media_type,
            reported_media_type: media_type,
        }
    }

    /// Makes path classification report `media_type` while opened entries keep reporting where
    /// they really live. Models an archive that was loaded into memory after requests were
    /// classified against its on-disk location.
    pub fn with_reported_media_type(
        mut self,
        media_type: MediaType,
    ) -> Self {
        self.reported_media_type = media_type;
        self
    }

    pub fn insert_raw(
        &self,
        path: &str,
        data: Vec<u8>,
    ) {
        let metadata = EntryMetadata {
            compressed_size: data.len() as u64,
            uncompressed_size: data.len() as u64,
            is_compressed: false,
            crc32: Some(crc32fast::hash(&data)),
            disk_offset: 0,
        };
        self.insert_entry(path, data, metadata);
    }

    pub fn insert_compressed(
        &self,
        path: &str,
        data: &[u8],
    ) -> std::io::Result<()> {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        let metadata = EntryMetadata {
            compressed_size: compressed.len() as u64,
            uncompressed_size: data.len() as u64,
            is_compressed: true,
            crc32: Some(crc32fast::hash(data)),
            disk_offset: 0,
        };
        self.insert_entry(path, compressed, metadata);
        Ok(())
    }

    /// Inserts already-stored bytes with caller provided metadata. The disk offset is assigned by
    /// the archive.
    pub fn insert_entry(
        &self,
        path: &str,
        stored: Vec<u8>,
        mut metadata: EntryMetadata,
    ) {
        let mut contents = self.contents.write().unwrap();
        metadata.disk_offset = contents.next_disk_offset;
        contents.next_disk_offset += stored.len() as u64;
        contents
            .entries
            .insert(path.to_string(), Arc::new(MemoryEntry { stored, metadata }));
    }

    pub fn remove(
        &self,
        path: &str,
    ) -> bool {
        self.contents
            .write()
            .unwrap()
            .entries
            .remove(path)
            .is_some()
    }

    fn entry(
        &self,
        path: &str,
    ) -> Option<Arc<MemoryEntry>> {
        self.contents.read().unwrap().entries.get(path).cloned()
    }
}

struct MemoryOpenedFile {
    entry: Arc<MemoryEntry>,
    media_type: MediaType,
}

impl OpenedFile for MemoryOpenedFile {
    fn metadata(&self) -> EntryMetadata {
        self.entry.metadata
    }

    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn read_at(
        &mut self,
        offset: u64,
        buffer: &mut [u8],
    ) -> std::io::Result<usize> {
        let stored = &self.entry.stored;
        if offset >= stored.len() as u64 {
            return Ok(0);
        }

        let offset = offset as usize;
        let len = buffer.len().min(stored.len() - offset);
        buffer[..len].copy_from_slice(&stored[offset..offset + len]);
        Ok(len)
    }
}

impl FileSource for MemoryFileSource {
    fn open_file(
        &self,
        path: &str,
    ) -> std::io::Result<Box<dyn OpenedFile>> {
        let entry = self.entry(path).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not in the archive", path),
            )
        })?;

        Ok(Box::new(MemoryOpenedFile {
            entry,
            media_type: self.resident_media_type,
        }))
    }

    fn exists(
        &self,
        path: &str,
    ) -> bool {
        self.entry(path).is_some()
    }

    fn media_type(
        &self,
        _path: &str,
    ) -> MediaType {
        self.reported_media_type
    }

    fn file_offset_on_media(
        &self,
        path: &str,
    ) -> u64 {
        self.entry(path)
            .map(|entry| entry.metadata.disk_offset)
            .unwrap_or(0)
    }
}

//
// Mount order
//
/// Searches a list of sources in mount order. The first source containing a path serves it.
#[derive(Default)]
pub struct LayeredFileSource {
    layers: Vec<Arc<dyn FileSource>>,
}

impl LayeredFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(
        &mut self,
        layer: Arc<dyn FileSource>,
    ) {
        self.layers.push(layer);
    }

    fn layer_for(
        &self,
        path: &str,
    ) -> Option<&Arc<dyn FileSource>> {
        self.layers.iter().find(|layer| layer.exists(path))
    }
}

impl FileSource for LayeredFileSource {
    fn open_file(
        &self,
        path: &str,
    ) -> std::io::Result<Box<dyn OpenedFile>> {
        match self.layer_for(path) {
            Some(layer) => layer.open_file(path),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not in any mounted source", path),
            )),
        }
    }

    fn exists(
        &self,
        path: &str,
    ) -> bool {
        self.layer_for(path).is_some()
    }

    fn media_type(
        &self,
        path: &str,
    ) -> MediaType {
        self.layer_for(path)
            .map(|layer| layer.media_type(path))
            .unwrap_or(MediaType::Unknown)
    }

    fn file_offset_on_media(
        &self,
        path: &str,
    ) -> u64 {
        self.layer_for(path)
            .map(|layer| layer.file_offset_on_media(path))
            .unwrap_or(0)
    }
}
