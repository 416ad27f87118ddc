#![doc = include_str!("../README.md")]

mod adapter;
mod async_bridge;
mod completion;
mod config;
mod content;
mod error;
mod processor;
mod routes;
mod server;
mod session;
mod tls;
mod untar;

pub use completion::Outcome;
pub use config::{Config, TlsVersion};
pub use content::{decode, DestinationContentType, SourceContentType, CONTENT_TYPE_HEADER};
pub use error::{ErrorKind, Result, UploadError};
pub use processor::{
    DataProcessor, ProcessorFactory, ProcessorRequest, RawCopyProcessor, RawCopyProcessorFactory,
    SourceReader,
};
pub use routes::{
    health_router, HEALTHZ_PATH, UPLOAD_ARCHIVE_PATHS, UPLOAD_ASYNC_PATHS, UPLOAD_FORM_ASYNC_PATHS,
    UPLOAD_FORM_PATHS, UPLOAD_PATHS,
};
pub use server::{BoundAddrs, RunReport, UploadServer};
pub use session::{Phase, PeerIdentity, UploadSession};
