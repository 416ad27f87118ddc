//! Classification of the upload content and the decompression that follows from it.
//!
//! The client announces what kind of stream it's sending in the [`CONTENT_TYPE_HEADER`] header.
//! That token is looked at exactly once per request, and the resulting reader is what every
//! downstream consumer reads from, so none of them need to know whether any decompression
//! happened.
use std::io::Read;
use std::str::FromStr;
use tracing::debug;

/// Request header announcing the [`SourceContentType`] of the upload body.
pub const CONTENT_TYPE_HEADER: &str = "x-cdi-content-type";

/// What the client is sending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceContentType {
    /// A disk image in any format the data processor understands.  Also the meaning of a
    /// missing header.
    #[default]
    Image,

    /// The raw bytes of a block device, compressed with the snappy framing format.
    BlockDeviceClone,

    /// A snappy-compressed tar archive of a filesystem.
    FilesystemClone,
}

impl SourceContentType {
    pub const BLOCK_DEVICE_CLONE: &'static str = "blockdevice-clone";
    pub const FILESYSTEM_CLONE: &'static str = "filesystem-clone";

    /// Classify the value of the content type header.
    ///
    /// Tokens that aren't recognized are treated as a plain image.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(token) => token.parse().unwrap_or_else(|_| {
                debug!(token, "Unrecognized content type token; treating as plain image");
                Self::Image
            }),
            None => Self::Image,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "",
            Self::BlockDeviceClone => Self::BLOCK_DEVICE_CLONE,
            Self::FilesystemClone => Self::FILESYSTEM_CLONE,
        }
    }
}

impl FromStr for SourceContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Ok(Self::Image),
            Self::BLOCK_DEVICE_CLONE => Ok(Self::BlockDeviceClone),
            Self::FILESYSTEM_CLONE => Ok(Self::FilesystemClone),
            other => Err(other.to_string()),
        }
    }
}

/// What the destination volume is supposed to end up holding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DestinationContentType {
    /// A single disk image for a virtual machine
    #[default]
    KubeVirt,

    /// The unpacked contents of a tar archive
    Archive,
}

/// Wrap `reader` in whatever decoding `content_type` calls for.
///
/// Block device clones are snappy-framed and are decompressed here; corrupt frames surface as
/// errors from `read`.  Every other content type is returned as-is.
pub fn decode<'a>(
    reader: Box<dyn Read + Send + 'a>,
    content_type: SourceContentType,
) -> Box<dyn Read + Send + 'a> {
    match content_type {
        SourceContentType::BlockDeviceClone => snappy_reader(reader),
        SourceContentType::Image | SourceContentType::FilesystemClone => reader,
    }
}

/// Decompress a snappy-framed stream
pub(crate) fn snappy_reader<'a>(reader: Box<dyn Read + Send + 'a>) -> Box<dyn Read + Send + 'a> {
    Box::new(snap::read::FrameDecoder::new(reader))
}
