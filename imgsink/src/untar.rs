//! Extraction of filesystem-clone archives.
//!
//! A filesystem clone is a tar archive.  When the destination is a raw block device only one
//! entry of that archive matters: the disk image, whose bytes are copied verbatim onto the
//! device.  When the destination is a mounted filesystem the whole tree is unpacked.
//!
//! Everything here is blocking I/O, because that's what the `tar` crate does.  Callers must run
//! it in a blocking worker.
use crate::{error, Result, UploadError};
use snafu::prelude::*;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::Path;
use tar::EntryType;
use tracing::{debug, debug_span, info};

/// Scan a tar stream for the first regular or sparse entry whose path contains `marker`, and copy
/// exactly its declared size in bytes into the sink produced by `open_sink`.
///
/// The sink is only opened once a matching entry is found.  Every other entry, including later
/// entries that also match, is skipped.  Returns the sink along with the number of bytes copied,
/// or `None` if the archive ended without any match.
pub(crate) fn copy_disk_image<R, W, F>(
    reader: R,
    marker: &str,
    open_sink: F,
) -> Result<Option<(W, u64)>>
where
    R: Read,
    W: Write,
    F: FnOnce() -> Result<W>,
{
    let mut archive = tar::Archive::new(reader);

    for result in archive.entries().map_err(tar_read_failure)? {
        let mut entry = result.map_err(tar_read_failure)?;

        let path = entry.path().context(error::TarReadSnafu)?.into_owned();
        let len = entry.size();
        let entry_type = entry.header().entry_type();

        let span = debug_span!("tar entry", path = %path.display(), len, ?entry_type);
        let _guard = span.enter();

        if !path.to_string_lossy().contains(marker) {
            debug!("Entry is not the disk image; skipping");
            continue;
        }

        match entry_type {
            EntryType::Regular | EntryType::GNUSparse => {
                info!(len, "Untarring disk image");

                let mut sink = open_sink()?;

                // `Entry` is itself a `Read` that is limited to the entry's data
                let written =
                    io::copy(&mut (&mut entry).take(len), &mut sink).map_err(tar_read_failure)?;

                if written != len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("disk image entry ended after {written} of {len} bytes"),
                    ))
                    .context(error::TarReadSnafu);
                }

                info!(written, "Wrote disk image");

                return Ok(Some((sink, written)));
            }
            other => {
                debug!(entry_type = ?other, "Entry name matches but it isn't a file; skipping");
            }
        }
    }

    Ok(None)
}

/// Copy the disk image inside a tar stream onto the block device at `device`.
///
/// The device is opened write-only in append mode, so the image lands wherever the device's
/// sequential write position starts.  An archive without a disk image entry is an error, since
/// otherwise the upload would report success without having written anything.
pub(crate) fn untar_to_block_device(reader: impl Read, device: &Path, marker: &str) -> Result<u64> {
    let open = || {
        OpenOptions::new()
            .append(true)
            .write(true)
            .open(device)
            .with_context(|_| error::OpenDestinationSnafu { path: device })
    };

    match copy_disk_image(reader, marker, open)? {
        Some((mut device_file, written)) => {
            device_file
                .flush()
                .with_context(|_| error::WriteDestinationSnafu { path: device })?;

            Ok(written)
        }
        None => error::DiskImageNotFoundSnafu { marker }.fail(),
    }
}

/// Unpack an entire tar stream into `dir`, recreating the directory tree.
pub(crate) fn unarchive_to_dir(reader: impl Read, dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    info!(dir = %dir.display(), "Unpacking archive");

    archive.unpack(dir).map_err(|source| {
        if error::is_corrupt_stream(&source) {
            UploadError::CorruptStream { source }
        } else {
            UploadError::Unarchive {
                path: dir.to_path_buf(),
                source,
            }
        }
    })
}

/// A read error from inside the archive is the client's fault when the compressed stream under it
/// is corrupt
fn tar_read_failure(source: io::Error) -> UploadError {
    if error::is_corrupt_stream(&source) {
        UploadError::CorruptStream { source }
    } else {
        UploadError::TarRead { source }
    }
}
