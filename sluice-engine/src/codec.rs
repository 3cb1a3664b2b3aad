use flate2::{Decompress, FlushDecompress, Status};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InflateStatus {
    // More input is expected
    Ok,
    // The compressed stream is complete
    StreamEnd,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InflateProgress {
    pub status: InflateStatus,
    pub bytes_in: usize,
    pub bytes_out: usize,
}

#[derive(Debug, Clone)]
pub struct CodecError(pub String);

impl std::error::Error for CodecError {}

impl core::fmt::Display for CodecError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        self.0.fmt(fmt)
    }
}

/// Streaming decompression state for one compressed entry. Input may arrive in arbitrary slices;
/// output is appended to whatever buffer the caller passes.
pub trait InflateStream: Send {
    /// Consumes as much of `input` as fits into `output`. `write_only_output` tells the codec the
    /// output memory must not be read back.
    fn inflate(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        write_only_output: bool,
    ) -> Result<InflateProgress, CodecError>;
}

pub trait Codec: Send + Sync {
    fn create_stream(&self) -> Box<dyn InflateStream>;

    /// Approximate memory held by one stream (state plus window). Charged against the temporary
    /// memory budget while a multi-page entry is being decompressed.
    fn state_size(&self) -> usize;
}

// Inflate state plus the 32KB history window
const DEFLATE_STATE_SIZE: usize = 44 * 1024;

/// Deflate codec backed by flate2. Archives store raw deflate streams by default.
pub struct DeflateCodec {
    zlib_header: bool,
}

impl Default for DeflateCodec {
    fn default() -> Self {
        DeflateCodec::raw()
    }
}

impl DeflateCodec {
    pub fn raw() -> Self {
        DeflateCodec { zlib_header: false }
    }

    pub fn zlib() -> Self {
        DeflateCodec { zlib_header: true }
    }
}

impl Codec for DeflateCodec {
    fn create_stream(&self) -> Box<dyn InflateStream> {
        Box::new(DeflateStream {
            decompress: Decompress::new(self.zlib_header),
        })
    }

    fn state_size(&self) -> usize {
        DEFLATE_STATE_SIZE
    }
}

struct DeflateStream {
    decompress: Decompress,
}

impl InflateStream for DeflateStream {
    // flate2 keeps its own history window, so the output is never read back and the hint has no
    // effect
    fn inflate(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        _write_only_output: bool,
    ) -> Result<InflateProgress, CodecError> {
        let total_in = self.decompress.total_in();
        let total_out = self.decompress.total_out();
        let status = self
            .decompress
            .decompress(input, output, FlushDecompress::None)
            .map_err(|e| CodecError(e.to_string()))?;

        let progress = InflateProgress {
            status: match status {
                Status::StreamEnd => InflateStatus::StreamEnd,
                Status::Ok | Status::BufError => InflateStatus::Ok,
            },
            bytes_in: (self.decompress.total_in() - total_in) as usize,
            bytes_out: (self.decompress.total_out() - total_out) as usize,
        };

        Ok(progress)
    }
}
