//! The contract between the upload server and whatever turns an upload stream into the contents
//! of the destination volume.
//!
//! The server itself never interprets image formats.  It hands the decoded body to a
//! [`DataProcessor`] built by the [`ProcessorFactory`] it was constructed with.  The factory is
//! the seam where a real conversion pipeline plugs in, and where tests substitute their own
//! behavior.
//!
//! [`RawCopyProcessorFactory`] is the default: it writes the stream to the destination verbatim.
use crate::content::DestinationContentType;
use crate::{error, untar, Result};
use snafu::prelude::*;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

/// The decoded upload body, as handed to a data processor.
///
/// This is a blocking reader.  Every method of [`DataProcessor`] is called from a blocking worker
/// thread.
pub type SourceReader = Box<dyn Read + Send + 'static>;

/// Size of the buffer used to shovel bytes from the upload stream to its destination
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Everything about the destination a processor needs to know.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessorRequest {
    pub destination: PathBuf,
    pub destination_type: DestinationContentType,

    /// `true` if `destination` is a raw block device rather than a file in a filesystem
    pub destination_is_block_device: bool,

    /// Mount point of the destination volume
    pub volume_dir: PathBuf,

    /// Where intermediate data may be kept
    pub scratch_dir: PathBuf,

    /// The declared size of the image in bytes, if any
    pub image_size: Option<u64>,

    pub filesystem_overhead: f64,
    pub preallocation: bool,
}

impl ProcessorRequest {
    /// How many bytes the destination can hold, or `None` if no image size was declared.
    ///
    /// A filesystem reserves part of the volume for its own metadata, so a file destination gets
    /// the declared size less the filesystem overhead.  A block device gets all of it.
    pub fn usable_size(&self) -> Option<u64> {
        let image_size = self.image_size?;

        if self.destination_is_block_device {
            Some(image_size)
        } else {
            Some((image_size as f64 * (1.0 - self.filesystem_overhead)).floor() as u64)
        }
    }
}

/// Processes one upload into the destination.
///
/// A processor is used in exactly one of two ways:
///
/// * [`Self::process_data`] runs everything to completion.
/// * [`Self::process_data_with_pause`] consumes the upload stream and validates it, then
///   [`Self::process_data_resume`] finishes the work later, after the client has already been
///   answered.
///
/// Either way must leave the destination in the same state.
pub trait DataProcessor: Send {
    fn process_data(&mut self) -> Result<()>;

    fn process_data_with_pause(&mut self) -> Result<()>;

    fn process_data_resume(&mut self) -> Result<()>;

    /// Whether the destination had its full size reserved.  Only meaningful after processing
    /// completed successfully.
    fn preallocation_applied(&self) -> bool;
}

#[cfg(test)]
impl std::fmt::Debug for dyn DataProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataProcessor")
    }
}

/// Creates a [`DataProcessor`] for an upload
pub trait ProcessorFactory: Send + Sync + 'static {
    fn create(
        &self,
        source: SourceReader,
        request: ProcessorRequest,
    ) -> Result<Box<dyn DataProcessor>>;
}

/// Factory for [`RawCopyProcessor`]
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCopyProcessorFactory;

impl ProcessorFactory for RawCopyProcessorFactory {
    fn create(
        &self,
        source: SourceReader,
        request: ProcessorRequest,
    ) -> Result<Box<dyn DataProcessor>> {
        Ok(Box::new(RawCopyProcessor::new(source, request)))
    }
}

/// Writes the upload to the destination without interpreting it.
///
/// Disk images are copied byte for byte into the destination, subject to the usable size of the
/// volume.  Archives are unpacked into the volume directory.  When paused, the upload is parked in
/// a scratch file until the processor is resumed.
pub struct RawCopyProcessor {
    source: Option<SourceReader>,
    request: ProcessorRequest,
    scratch: Option<NamedTempFile>,
    preallocation_applied: bool,
}

impl RawCopyProcessor {
    pub fn new(source: SourceReader, request: ProcessorRequest) -> Self {
        Self {
            source: Some(source),
            request,
            scratch: None,
            preallocation_applied: false,
        }
    }

    fn take_source(&mut self) -> Result<SourceReader> {
        self.source.take().context(error::SourceConsumedSnafu)
    }

    /// The size limit to enforce while reading the upload.  Archives are unpacked as-is.
    fn size_limit(&self) -> Option<u64> {
        match self.request.destination_type {
            DestinationContentType::KubeVirt => self.request.usable_size(),
            DestinationContentType::Archive => None,
        }
    }

    fn deliver(&mut self, reader: impl Read) -> Result<()> {
        match self.request.destination_type {
            DestinationContentType::Archive => {
                untar::unarchive_to_dir(reader, &self.request.volume_dir)
            }
            DestinationContentType::KubeVirt => self.write_image(reader),
        }
    }

    fn write_image(&mut self, reader: impl Read) -> Result<()> {
        let destination = self.request.destination.clone();
        let limit = self.size_limit();

        let mut file = open_destination(&destination, self.request.destination_is_block_device)?;

        let written = copy_limited(reader, &mut file, &destination, limit)?;
        info!(written, destination = %destination.display(), "Wrote image to destination");

        self.preallocation_applied = self.preallocate(&file, &destination)?;

        file.sync_all()
            .with_context(|_| error::WriteDestinationSnafu { path: &destination })
    }

    /// Extend a file destination to the full usable size, if preallocation was requested.
    fn preallocate(&self, file: &File, destination: &Path) -> Result<bool> {
        if !self.request.preallocation || self.request.destination_is_block_device {
            return Ok(false);
        }

        let Some(usable_size) = self.request.usable_size() else {
            debug!("Preallocation requested but no image size declared; skipping");
            return Ok(false);
        };

        let current_len = file
            .metadata()
            .with_context(|_| error::WriteDestinationSnafu { path: destination })?
            .len();

        if current_len < usable_size {
            file.set_len(usable_size)
                .with_context(|_| error::WriteDestinationSnafu { path: destination })?;
        }

        info!(usable_size, "Preallocated destination");

        Ok(true)
    }
}

impl DataProcessor for RawCopyProcessor {
    #[instrument(skip(self), fields(destination = %self.request.destination.display()))]
    fn process_data(&mut self) -> Result<()> {
        let source = self.take_source()?;

        self.deliver(source)
    }

    #[instrument(skip(self), fields(scratch_dir = %self.request.scratch_dir.display()))]
    fn process_data_with_pause(&mut self) -> Result<()> {
        let source = self.take_source()?;
        let limit = self.size_limit();

        let mut scratch = NamedTempFile::new_in(&self.request.scratch_dir).with_context(|_| {
            error::ScratchFileSnafu {
                path: &self.request.scratch_dir,
            }
        })?;
        let scratch_path = scratch.path().to_path_buf();

        let written = copy_limited(source, scratch.as_file_mut(), &scratch_path, limit)?;
        info!(written, "Upload parked in scratch space; pausing");

        self.scratch = Some(scratch);

        Ok(())
    }

    #[instrument(skip(self), fields(destination = %self.request.destination.display()))]
    fn process_data_resume(&mut self) -> Result<()> {
        let scratch = self.scratch.take().context(error::ResumeWithoutPauseSnafu)?;
        let scratch_path = scratch.path().to_path_buf();

        let parked = scratch
            .reopen()
            .with_context(|_| error::ScratchFileSnafu {
                path: &scratch_path,
            })?;

        self.deliver(BufReader::new(parked))?;

        scratch
            .close()
            .with_context(|_| error::ScratchFileSnafu {
                path: &scratch_path,
            })
    }

    fn preallocation_applied(&self) -> bool {
        self.preallocation_applied
    }
}

fn open_destination(path: &Path, block_device: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);

    // A block device has a fixed size and can't be created or truncated
    if !block_device {
        options.create(true).truncate(true);
    }

    options
        .open(path)
        .with_context(|_| error::OpenDestinationSnafu { path })
}

/// Copy `reader` into `writer`, failing with [`crate::UploadError::ValidationSize`] as soon as
/// more than `limit` bytes have been read.  Nothing past the limit is written.
fn copy_limited(
    mut reader: impl Read,
    writer: &mut impl Write,
    path: &Path,
    limit: Option<u64>,
) -> Result<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(bytes_read) => bytes_read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(error::read_failure(e)),
        };

        total += bytes_read as u64;

        if let Some(available) = limit {
            ensure!(
                total <= available,
                error::ValidationSizeSnafu {
                    available,
                    actual: total
                }
            );
        }

        writer
            .write_all(&buffer[..bytes_read])
            .with_context(|_| error::WriteDestinationSnafu { path })?;
    }

    writer
        .flush()
        .with_context(|_| error::WriteDestinationSnafu { path })?;

    Ok(total)
}
