//! Chooses how an admitted upload gets processed, based on what the client sent and what the
//! destination should end up holding.
//!
//! Everything here blocks; handlers call into it from a blocking worker.
use crate::content::{self, DestinationContentType, SourceContentType};
use crate::processor::{DataProcessor, ProcessorFactory, ProcessorRequest, SourceReader};
use crate::{error, untar, Config, Result};
use snafu::prelude::*;
use std::path::PathBuf;
use tracing::info;

/// The parts of the server configuration that processing depends on, resolved once at startup.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ProcessingContext {
    pub destination: PathBuf,
    pub destination_is_block_device: bool,
    pub volume_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub disk_image_name: String,
    pub image_size: Option<u64>,
    pub filesystem_overhead: f64,
    pub preallocation: bool,
}

impl ProcessingContext {
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            destination: config.destination.clone(),
            destination_is_block_device: config.destination_is_block_device(),
            volume_dir: config.volume_dir.clone(),
            scratch_dir: config.scratch_dir.clone(),
            disk_image_name: config.disk_image_name.clone(),
            image_size: config.image_size_bytes()?,
            filesystem_overhead: config.filesystem_overhead,
            preallocation: config.preallocation,
        })
    }

    fn request(&self, destination_type: DestinationContentType) -> ProcessorRequest {
        ProcessorRequest {
            destination: self.destination.clone(),
            destination_type,
            destination_is_block_device: self.destination_is_block_device,
            volume_dir: self.volume_dir.clone(),
            scratch_dir: self.scratch_dir.clone(),
            image_size: self.image_size,
            filesystem_overhead: self.filesystem_overhead,
            preallocation: self.preallocation,
        }
    }
}

/// Process an upload to completion.  Returns whether preallocation was applied.
///
/// Filesystem clones bypass the data processor entirely and go straight to the archive
/// extractor.
pub(crate) fn process_sync(
    factory: &dyn ProcessorFactory,
    source: SourceReader,
    source_type: SourceContentType,
    destination_type: DestinationContentType,
    context: &ProcessingContext,
) -> Result<bool> {
    let source = content::decode(source, source_type);

    if source_type == SourceContentType::FilesystemClone {
        clone_filesystem(source, context)?;

        return Ok(false);
    }

    let mut processor = factory.create(source, context.request(destination_type))?;
    processor.process_data()?;

    Ok(processor.preallocation_applied())
}

/// Run the first half of an async upload: consume and validate the upload stream, then return the
/// paused processor so the rest can run after the client has its response.
pub(crate) fn start_async(
    factory: &dyn ProcessorFactory,
    source: SourceReader,
    source_type: SourceContentType,
    context: &ProcessingContext,
) -> Result<Box<dyn DataProcessor>> {
    // An archive can't be parked halfway through unpacking
    ensure!(
        source_type != SourceContentType::FilesystemClone,
        error::AsyncFilesystemCloneUnsupportedSnafu
    );

    let source = content::decode(source, source_type);

    let mut processor = factory.create(source, context.request(DestinationContentType::KubeVirt))?;
    processor.process_data_with_pause()?;

    Ok(processor)
}

/// A filesystem clone is a snappy-compressed tar archive.  On a block device only the disk image
/// inside it is kept; on a filesystem the whole tree is unpacked into the volume.
fn clone_filesystem(source: SourceReader, context: &ProcessingContext) -> Result<()> {
    let archive = content::snappy_reader(source);

    if context.destination_is_block_device {
        let written =
            untar::untar_to_block_device(archive, &context.destination, &context.disk_image_name)?;

        info!(
            written,
            destination = %context.destination.display(),
            "Cloned filesystem disk image to block device"
        );
    } else {
        untar::unarchive_to_dir(archive, &context.volume_dir)?;

        info!(volume_dir = %context.volume_dir.display(), "Cloned filesystem into volume");
    }

    Ok(())
}
