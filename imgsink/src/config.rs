use crate::{error, Result};
use snafu::prelude::*;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum TLS protocol version the ingestion listener will negotiate.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TlsVersion {
    #[default]
    #[cfg_attr(feature = "clap", value(name = "1.2"))]
    Tls12,
    #[cfg_attr(feature = "clap", value(name = "1.3"))]
    Tls13,
}

/// The configuration settings of a single upload server.
///
/// One server handles exactly one volume: `destination` is fixed for the whole process lifetime.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Address the ingestion listener binds to
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_BIND_ADDRESS", default_value = "0.0.0.0")
    )]
    pub bind_address: IpAddr,

    /// Port of the ingestion listener.  0 picks an ephemeral port.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_BIND_PORT", default_value = "8443")
    )]
    pub bind_port: u16,

    /// Port of the health listener, which serves `/healthz` on all interfaces.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_HEALTH_PORT", default_value = "8080")
    )]
    pub health_port: u16,

    /// Where the uploaded image is written.
    ///
    /// If this equals `block_device_path` the destination is treated as a raw block device,
    /// otherwise it's a file inside a mounted filesystem.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_DESTINATION", default_value = "/data/disk.img")
    )]
    pub destination: PathBuf,

    /// Path at which a block volume is exposed to this process
    #[cfg_attr(
        feature = "clap",
        clap(
            long,
            env = "IMGSINK_BLOCK_DEVICE_PATH",
            default_value = "/dev/cdi-block-volume"
        )
    )]
    pub block_device_path: PathBuf,

    /// Mount point of the destination filesystem.  Archives and filesystem clones are unpacked
    /// here.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_VOLUME_DIR", default_value = "/data")
    )]
    pub volume_dir: PathBuf,

    /// Directory for temporary data kept between the two phases of an async upload
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_SCRATCH_DIR", default_value = "/scratch")
    )]
    pub scratch_dir: PathBuf,

    /// Name of the disk image entry inside a filesystem-clone archive.
    ///
    /// Any archive entry whose path contains this string is a candidate.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_DISK_IMAGE_NAME", default_value = "disk.img")
    )]
    pub disk_image_name: String,

    /// PEM-encoded private key of the ingestion listener.  Serve plain HTTP if unset.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_TLS_KEY", hide_env_values = true)
    )]
    pub tls_key: Option<String>,

    /// PEM-encoded certificate chain of the ingestion listener
    #[cfg_attr(feature = "clap", clap(long, env = "IMGSINK_TLS_CERT"))]
    pub tls_cert: Option<String>,

    /// PEM-encoded CA bundle used to verify client certificates.
    ///
    /// When set, every client must present a certificate signed by one of these CAs.
    #[cfg_attr(feature = "clap", clap(long, env = "IMGSINK_CLIENT_CERT"))]
    pub client_ca: Option<String>,

    /// Common name a client certificate must carry for an upload to be accepted
    #[cfg_attr(feature = "clap", clap(long, env = "IMGSINK_CLIENT_NAME"))]
    pub client_name: Option<String>,

    /// Minimum TLS version to negotiate
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_TLS_MIN_VERSION", value_enum, default_value = "1.2")
    )]
    pub tls_min_version: TlsVersion,

    /// Declared size of the target image, ie "10Gi" or "2147483648".
    ///
    /// Uploads that don't fit are rejected.  If unset the size isn't checked.
    #[cfg_attr(feature = "clap", clap(long, env = "IMGSINK_IMAGE_SIZE"))]
    pub image_size: Option<String>,

    /// Fraction of a filesystem volume reserved for filesystem metadata, between 0 and 1
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_FILESYSTEM_OVERHEAD", default_value = "0.055")
    )]
    pub filesystem_overhead: f64,

    /// Reserve the full image size on the destination instead of writing sparsely
    #[cfg_attr(feature = "clap", clap(long, env = "IMGSINK_PREALLOCATION"))]
    pub preallocation: bool,

    /// How long a client may take to send the request headers
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_HEADER_READ_TIMEOUT", value_parser = parse_duration_secs, default_value = "10")
    )]
    pub header_read_timeout: Duration,

    /// How long to wait for in-flight requests to finish when shutting down a listener
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "IMGSINK_SHUTDOWN_GRACE_PERIOD", value_parser = parse_duration_secs, default_value = "30")
    )]
    pub shutdown_grace_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Duplicated here and in the `clap` attributes.  The `defaults_match` test catches
        // any drift between the two.
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 8443,
            health_port: 8080,
            destination: PathBuf::from("/data/disk.img"),
            block_device_path: PathBuf::from("/dev/cdi-block-volume"),
            volume_dir: PathBuf::from("/data"),
            scratch_dir: PathBuf::from("/scratch"),
            disk_image_name: "disk.img".to_string(),
            tls_key: None,
            tls_cert: None,
            client_ca: None,
            client_name: None,
            tls_min_version: TlsVersion::Tls12,
            image_size: None,
            filesystem_overhead: 0.055,
            preallocation: false,
            header_read_timeout: Duration::from_secs(10),
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Check for combinations of settings that can't possibly work, before any listener is
    /// bound.
    pub fn validate(&self) -> Result<()> {
        if self.tls_key.is_some() != self.tls_cert.is_some() {
            return error::InvalidConfigSnafu {
                message: "TLS key and TLS certificate must be provided together",
            }
            .fail();
        }

        if self.client_ca.is_some() {
            ensure!(
                self.tls_key.is_some(),
                error::InvalidConfigSnafu {
                    message: "a client CA requires the server TLS key and certificate",
                }
            );
            ensure!(
                self.client_name.is_some(),
                error::InvalidConfigSnafu {
                    message: "a client CA requires the expected client name",
                }
            );
        }

        // Without a client CA, TLS clients are never asked for a certificate to match the name
        // against
        if self.tls_enabled() && self.client_name.is_some() {
            ensure!(
                self.client_ca.is_some(),
                error::InvalidConfigSnafu {
                    message: "the expected client name requires a client CA",
                }
            );
        }

        ensure!(
            (0.0..=1.0).contains(&self.filesystem_overhead),
            error::InvalidConfigSnafu {
                message: format!(
                    "filesystem overhead {} is not between 0 and 1",
                    self.filesystem_overhead
                ),
            }
        );

        self.image_size_bytes()?;

        Ok(())
    }

    /// `true` if uploads go to a raw block device rather than into a filesystem
    pub fn destination_is_block_device(&self) -> bool {
        self.destination == self.block_device_path
    }

    /// Whether the ingestion listener is served over TLS
    pub fn tls_enabled(&self) -> bool {
        self.tls_key.is_some() && self.tls_cert.is_some()
    }

    /// The declared image size in bytes, if one was declared.
    pub fn image_size_bytes(&self) -> Result<Option<u64>> {
        self.image_size
            .as_deref()
            .filter(|size| !size.trim().is_empty())
            .map(parse_image_size)
            .transpose()
    }
}

/// Parse a byte quantity as written in a volume spec.
///
/// Accepts plain integers as well as `byte-unit` suffixes.  Kubernetes-style binary suffixes
/// like "Gi" are accepted as shorthand for "GiB".
pub(crate) fn parse_image_size(size: &str) -> Result<u64> {
    let trimmed = size.trim();

    let normalized = if trimmed.ends_with('i') {
        format!("{trimmed}B")
    } else {
        trimmed.to_string()
    };

    let bytes = byte_unit::Byte::from_str(&normalized)
        .map_err(|_| error::InvalidImageSizeSnafu { size }.build())?;

    u64::try_from(bytes.get_bytes()).map_err(|_| error::InvalidImageSizeSnafu { size }.build())
}

#[cfg(feature = "clap")]
fn parse_duration_secs(value: &str) -> std::result::Result<Duration, std::num::ParseIntError> {
    value.parse::<u64>().map(Duration::from_secs)
}
