use http::StatusCode;
use snafu::prelude::*;
use std::path::PathBuf;

pub type Result<T, E = UploadError> = std::result::Result<T, E>;

/// Coarse classification of an [`UploadError`], used to decide how a failure is reported to the
/// client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was refused before any data was read (busy, already done, bad peer, bad
    /// method).
    Admission,

    /// The request body could not be decoded (malformed multipart body, corrupt compressed
    /// stream).
    Decode,

    /// The upload didn't satisfy the declared image size.
    Validation,

    /// Anything that went wrong while writing the upload to its destination.
    Processing,

    /// The server was asked to do something its configuration doesn't permit.
    Configuration,

    /// Listener or TLS failures that aren't tied to any one request.
    Transport,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum UploadError {
    #[snafu(display("Got concurrent upload request while another upload is in progress"))]
    ConcurrentUpload,

    #[snafu(display("Got upload request after the upload is already done"))]
    AlreadyDone,

    #[snafu(display("No presented client certificate has the common name '{expected}'"))]
    Unauthorized { expected: String },

    #[snafu(display("HTTP method {method} is not supported on this path"))]
    MethodNotAllowed { method: http::Method },

    #[snafu(display("Error reading the multipart request body"))]
    MultipartBody { source: axum::extract::multipart::MultipartError },

    #[snafu(display("Error reading the multipart request body: {message}"))]
    MultipartRejected { message: String },

    #[snafu(display("The multipart request body has no part named '{field}'"))]
    MissingFilePart { field: String },

    #[snafu(display("Error reading the request body"))]
    RequestBody { source: axum::Error },

    #[snafu(display(
        "Upload of {actual} bytes or more exceeds the available space of {available} bytes"
    ))]
    ValidationSize { available: u64, actual: u64 },

    #[snafu(display("The image size '{size}' is not a valid byte quantity"))]
    InvalidImageSize { size: String },

    #[snafu(display("Async filesystem clone is not supported"))]
    AsyncFilesystemCloneUnsupported,

    #[snafu(display("No entry containing '{marker}' was found in the uploaded archive"))]
    DiskImageNotFound { marker: String },

    #[snafu(display("Error reading tar archive"))]
    TarRead { source: std::io::Error },

    #[snafu(display("Error unarchiving to {}", path.display()))]
    Unarchive {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error opening destination {}", path.display()))]
    OpenDestination {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error writing to destination {}", path.display()))]
    WriteDestination {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error creating scratch file in {}", path.display()))]
    ScratchFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error reading the upload stream"))]
    ReadStream { source: std::io::Error },

    #[snafu(display("The compressed upload stream is corrupt"))]
    CorruptStream { source: std::io::Error },

    #[snafu(display("The data processor failed: {message}"))]
    ProcessorFailed { message: String },

    #[snafu(display("The upload stream was already consumed by an earlier processing step"))]
    SourceConsumed,

    #[snafu(display("Background processing ended without reporting a result"))]
    ProcessingAbandoned,

    #[snafu(display("Data processor was resumed without having been paused"))]
    ResumeWithoutPause,

    #[snafu(display("Error spawning a blocking task"))]
    SpawnBlocking { source: tokio::task::JoinError },

    #[snafu(display("Error spawning an async task"))]
    Spawn { source: tokio::task::JoinError },

    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig { message: String },

    #[snafu(display("The {what} PEM data is invalid"))]
    InvalidPem {
        what: &'static str,
        source: std::io::Error,
    },

    #[snafu(display("The {what} PEM data doesn't contain any {what}"))]
    EmptyPem { what: &'static str },

    #[snafu(display("Error building TLS configuration"))]
    TlsConfig { source: rustls::Error },

    #[snafu(display("Error building the client certificate verifier"))]
    ClientVerifier {
        source: rustls::server::VerifierBuilderError,
    },

    #[snafu(display("Error binding {listener} listener to {address}"))]
    Bind {
        listener: &'static str,
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("The {listener} listener failed"))]
    Listener {
        listener: &'static str,
        source: std::io::Error,
    },

    #[snafu(display("The {listener} listener exited unexpectedly"))]
    ListenerExited { listener: &'static str },

    #[snafu(display("The server stopped without reporting an upload outcome"))]
    CompletionDropped,
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        use UploadError::*;

        match self {
            ConcurrentUpload | AlreadyDone | Unauthorized { .. } | MethodNotAllowed { .. } => {
                ErrorKind::Admission
            }
            MultipartBody { .. }
            | MultipartRejected { .. }
            | MissingFilePart { .. }
            | RequestBody { .. }
            | CorruptStream { .. } => ErrorKind::Decode,
            ValidationSize { .. } => ErrorKind::Validation,
            AsyncFilesystemCloneUnsupported | InvalidImageSize { .. } | InvalidConfig { .. } => {
                ErrorKind::Configuration
            }
            InvalidPem { .. }
            | EmptyPem { .. }
            | TlsConfig { .. }
            | ClientVerifier { .. }
            | Bind { .. }
            | Listener { .. }
            | ListenerExited { .. }
            | CompletionDropped => ErrorKind::Transport,
            DiskImageNotFound { .. }
            | TarRead { .. }
            | Unarchive { .. }
            | OpenDestination { .. }
            | WriteDestination { .. }
            | ScratchFile { .. }
            | ReadStream { .. }
            | ProcessorFailed { .. }
            | SourceConsumed
            | ProcessingAbandoned
            | ResumeWithoutPause
            | SpawnBlocking { .. }
            | Spawn { .. } => ErrorKind::Processing,
        }
    }

    /// `true` if the request failed before any of the upload could have reached the destination.
    ///
    /// Such a failure gives the admission back, and the client may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MultipartBody { .. }
                | Self::MultipartRejected { .. }
                | Self::MissingFilePart { .. }
                | Self::AsyncFilesystemCloneUnsupported
        )
    }

    /// The HTTP status a handler should answer with when a request fails with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConcurrentUpload => StatusCode::SERVICE_UNAVAILABLE,
            Self::AlreadyDone => StatusCode::CONFLICT,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::MethodNotAllowed { .. } => StatusCode::NOT_FOUND,
            _ => match self.kind() {
                ErrorKind::Decode | ErrorKind::Validation | ErrorKind::Configuration => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// Classify an error returned by `read` on a (possibly decompressing) upload stream.
///
/// The snappy decoder reports corrupt frames as `io::Error`s wrapping a `snap::Error`; those are
/// the client's fault.  Anything else is a failure to receive the body.
pub(crate) fn read_failure(source: std::io::Error) -> UploadError {
    if is_corrupt_stream(&source) {
        UploadError::CorruptStream { source }
    } else {
        UploadError::ReadStream { source }
    }
}

/// `true` if a `snap::Error` is anywhere in the chain of `error`.
///
/// The `tar` crate wraps the errors of its reader in errors of its own, so the decoder's error
/// can be several `io::Error`s deep.  `io::Error::source` skips over the wrapped error itself,
/// hence the walk through `get_ref`.
pub(crate) fn is_corrupt_stream(error: &std::io::Error) -> bool {
    let mut next: Option<&(dyn std::error::Error + 'static)> = Some(error);

    while let Some(current) = next {
        if current.is::<snap::Error>() {
            return true;
        }

        next = match current.downcast_ref::<std::io::Error>() {
            Some(io) => io
                .get_ref()
                .map(|inner| inner as &(dyn std::error::Error + 'static)),
            None => current.source(),
        };
    }

    false
}
