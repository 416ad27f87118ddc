//! HTTP routes of the ingestion and health listeners.
//!
//! Every upload path funnels into one of two handlers.  The sync handler answers once the upload
//! is fully processed.  The async handler answers as soon as the upload has been received and
//! validated, and finishes processing in the background.  Either way the body is streamed to a
//! blocking worker and never buffered in memory.
use crate::adapter::{self, ProcessingContext};
use crate::async_bridge::stream_as_reader;
use crate::content::{DestinationContentType, SourceContentType, CONTENT_TYPE_HEADER};
use crate::processor::{DataProcessor, ProcessorFactory, SourceReader};
use crate::session::{AdmissionTicket, PeerIdentity, UploadSession};
use crate::{error, Result, UploadError};
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Extension, Router};
use bytes::Bytes;
use http::{Method, StatusCode};
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Raw body, processed before the response is sent
pub const UPLOAD_PATHS: [&str; 2] = ["/v1alpha1/upload", "/v1beta1/upload"];

/// Raw body, processed in the background after the response is sent
pub const UPLOAD_ASYNC_PATHS: [&str; 2] = ["/v1alpha1/upload-async", "/v1beta1/upload-async"];

/// Raw body holding a tar archive that's unpacked into the volume
pub const UPLOAD_ARCHIVE_PATHS: [&str; 2] =
    ["/v1alpha1/upload-archive", "/v1beta1/upload-archive"];

/// Multipart form, processed before the response is sent
pub const UPLOAD_FORM_PATHS: [&str; 2] = ["/v1alpha1/upload-form", "/v1beta1/upload-form"];

/// Multipart form, processed in the background after the response is sent
pub const UPLOAD_FORM_ASYNC_PATHS: [&str; 2] =
    ["/v1alpha1/upload-form-async", "/v1beta1/upload-form-async"];

pub const HEALTHZ_PATH: &str = "/healthz";

/// Name of the multipart form field carrying the upload
const FILE_FIELD: &str = "file";

/// How many body chunks of a multipart upload may be in flight between the request and the
/// blocking worker
const FORM_CHUNK_QUEUE_DEPTH: usize = 16;

#[derive(Clone)]
pub(crate) struct AppState {
    pub session: Arc<UploadSession>,
    pub factory: Arc<dyn ProcessorFactory>,
    pub context: Arc<ProcessingContext>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyEncoding {
    /// The request body is the upload
    Raw,

    /// The upload is the `file` part of a multipart form
    Form,
}

pub(crate) fn upload_router(state: AppState) -> Router {
    let mut router = Router::new();

    for path in UPLOAD_PATHS {
        router = router.route(path, any(upload));
    }
    for path in UPLOAD_ASYNC_PATHS {
        router = router.route(path, any(upload_async));
    }
    for path in UPLOAD_ARCHIVE_PATHS {
        router = router.route(path, any(upload_archive));
    }
    for path in UPLOAD_FORM_PATHS {
        router = router.route(path, any(upload_form));
    }
    for path in UPLOAD_FORM_ASYNC_PATHS {
        router = router.route(path, any(upload_form_async));
    }

    // Disk images are far larger than axum's default limit on extracted bodies, which would
    // otherwise cap every multipart upload at 2 MiB
    router
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router of the health listener.  Stateless; answers `OK` to anything on [`HEALTHZ_PATH`].
pub fn health_router() -> Router {
    Router::new().route(HEALTHZ_PATH, any(healthz))
}

async fn healthz() -> &'static str {
    "OK"
}

async fn upload(
    State(state): State<AppState>,
    peer: Option<Extension<PeerIdentity>>,
    request: Request,
) -> Response {
    handle_sync(
        state,
        peer_identity(peer),
        request,
        BodyEncoding::Raw,
        DestinationContentType::KubeVirt,
    )
    .await
}

async fn upload_archive(
    State(state): State<AppState>,
    peer: Option<Extension<PeerIdentity>>,
    request: Request,
) -> Response {
    handle_sync(
        state,
        peer_identity(peer),
        request,
        BodyEncoding::Raw,
        DestinationContentType::Archive,
    )
    .await
}

async fn upload_form(
    State(state): State<AppState>,
    peer: Option<Extension<PeerIdentity>>,
    request: Request,
) -> Response {
    handle_sync(
        state,
        peer_identity(peer),
        request,
        BodyEncoding::Form,
        DestinationContentType::KubeVirt,
    )
    .await
}

async fn upload_async(
    State(state): State<AppState>,
    peer: Option<Extension<PeerIdentity>>,
    request: Request,
) -> Response {
    handle_async(state, peer_identity(peer), request, BodyEncoding::Raw).await
}

async fn upload_form_async(
    State(state): State<AppState>,
    peer: Option<Extension<PeerIdentity>>,
    request: Request,
) -> Response {
    handle_async(state, peer_identity(peer), request, BodyEncoding::Form).await
}

/// Connections that didn't go through a TLS handshake carry no identity
fn peer_identity(peer: Option<Extension<PeerIdentity>>) -> PeerIdentity {
    peer.map(|Extension(peer)| peer)
        .unwrap_or(PeerIdentity::Plaintext)
}

async fn handle_sync(
    state: AppState,
    peer: PeerIdentity,
    request: Request,
    encoding: BodyEncoding,
    destination_type: DestinationContentType,
) -> Response {
    if request.method() != Method::POST {
        return method_not_allowed(request.method());
    }

    let ticket = match state.session.admit(&peer) {
        Ok(ticket) => ticket,
        Err(e) => return e.into_response(),
    };

    let source_type = source_content_type(&request);

    // The upload runs in its own task, so that a client hanging up can't cancel it halfway
    // through and leave the session without an outcome
    let upload = tokio::spawn(async move {
        let AppState {
            factory, context, ..
        } = state;

        let result = receive(request, encoding, move |source| {
            adapter::process_sync(&*factory, source, source_type, destination_type, &context)
        })
        .await;

        let response = match &result {
            Ok(preallocation_applied) => {
                info!(
                    preallocation_applied,
                    ?destination_type,
                    "Wrote upload to destination"
                );
                StatusCode::OK.into_response()
            }
            Err(e) => saving_failed(e),
        };

        settle(ticket, result);

        response
    });

    match upload.await {
        Ok(response) => response,
        Err(e) => saving_failed(&UploadError::Spawn { source: e }),
    }
}

async fn handle_async(
    state: AppState,
    peer: PeerIdentity,
    request: Request,
    encoding: BodyEncoding,
) -> Response {
    // Clients probe the async path to find out whether the server supports it
    if request.method() == Method::HEAD {
        return StatusCode::OK.into_response();
    }

    if request.method() != Method::POST {
        return method_not_allowed(request.method());
    }

    let mut ticket = match state.session.admit(&peer) {
        Ok(ticket) => ticket,
        Err(e) => return e.into_response(),
    };

    let source_type = source_content_type(&request);

    let upload = tokio::spawn(async move {
        let AppState {
            factory, context, ..
        } = state;

        let started = receive(request, encoding, move |source| {
            adapter::start_async(&*factory, source, source_type, &context)
        })
        .await;

        match started {
            Ok(processor) => {
                ticket.begin_processing();
                tokio::spawn(resume(ticket, processor));

                info!("Returning success to caller, continuing processing in the background");
                StatusCode::OK.into_response()
            }
            Err(e) => {
                let response = saving_failed(&e);
                settle(ticket, Err(e));

                response
            }
        }
    });

    match upload.await {
        Ok(response) => response,
        Err(e) => saving_failed(&UploadError::Spawn { source: e }),
    }
}

/// Second half of an async upload, after the client already has its response
async fn resume(ticket: AdmissionTicket, mut processor: Box<dyn DataProcessor>) {
    let result = tokio::task::spawn_blocking(move || -> Result<bool> {
        processor.process_data_resume()?;

        Ok(processor.preallocation_applied())
    })
    .await;

    let result = match result {
        Ok(result) => result,
        Err(e) => Err(UploadError::SpawnBlocking { source: e }),
    };

    ticket.finish_async(result);
}

/// Resolve the admission of a request whose processing ended with `result`
fn settle(ticket: AdmissionTicket, result: Result<bool>) {
    match result {
        Err(e) if e.is_retryable() => {
            debug!(error = %e, "Upload rejected before reaching the destination");
            ticket.release();
        }
        result => ticket.finish_sync(result),
    }
}

/// Stream the upload out of `request` into `work`, which runs in a blocking worker.
async fn receive<T, F>(request: Request, encoding: BodyEncoding, work: F) -> Result<T>
where
    F: FnOnce(SourceReader) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match encoding {
        BodyEncoding::Raw => {
            let source: SourceReader =
                Box::new(stream_as_reader(request.into_body().into_data_stream()));

            tokio::task::spawn_blocking(move || work(source))
                .await
                .context(error::SpawnBlockingSnafu)?
        }
        BodyEncoding::Form => {
            let mut multipart = Multipart::from_request(request, &())
                .await
                .map_err(|rejection| {
                    error::MultipartRejectedSnafu {
                        message: rejection.body_text(),
                    }
                    .build()
                })?;

            let mut field = loop {
                match multipart
                    .next_field()
                    .await
                    .context(error::MultipartBodySnafu)?
                {
                    Some(field) if field.name() == Some(FILE_FIELD) => break field,
                    Some(field) => {
                        info!(name = ?field.name(), "Ignoring multipart form part");
                    }
                    None => {
                        return error::MissingFilePartSnafu { field: FILE_FIELD }.fail();
                    }
                }
            };

            // `Field` borrows the multipart body, so it can't be moved into the blocking worker.
            // Its chunks are forwarded over a channel instead.
            let (sender, receiver) = mpsc::channel::<std::io::Result<Bytes>>(FORM_CHUNK_QUEUE_DEPTH);
            let source: SourceReader = Box::new(stream_as_reader(ReceiverStream::new(receiver)));

            let mut processing = tokio::task::spawn_blocking(move || work(source));

            let pump = async move {
                loop {
                    let chunk = match field.chunk().await {
                        Ok(Some(chunk)) => Ok(chunk),
                        Ok(None) => break,
                        Err(e) => Err(std::io::Error::other(e)),
                    };
                    let failed = chunk.is_err();

                    if sender.send(chunk).await.is_err() || failed {
                        break;
                    }
                }

                // Closing the channel is how the worker learns the upload is over
                drop(sender);
            };
            tokio::pin!(pump);

            // If the worker stops reading early it has its answer, and the rest of the body is
            // irrelevant
            let finished_early = tokio::select! {
                result = &mut processing => Some(result),
                () = &mut pump => None,
            };

            let result = match finished_early {
                Some(result) => result,
                None => processing.await,
            };

            result.context(error::SpawnBlockingSnafu)?
        }
    }
}

fn source_content_type(request: &Request) -> SourceContentType {
    let header = request
        .headers()
        .get(CONTENT_TYPE_HEADER)
        .and_then(|value| value.to_str().ok());

    let source_type = SourceContentType::from_header(header);
    info!(
        header = header.unwrap_or_default(),
        ?source_type,
        "Content type header"
    );

    source_type
}

fn method_not_allowed(method: &Method) -> Response {
    debug!(%method, "Refusing request with unsupported method");

    UploadError::MethodNotAllowed {
        method: method.clone(),
    }
    .into_response()
}

fn saving_failed(e: &UploadError) -> Response {
    let message = error_chain(e);
    error!(error = %message, "Saving stream failed");

    (e.status_code(), format!("Saving stream failed: {message}")).into_response()
}

/// The error message followed by the messages of all of its sources
fn error_chain(e: &UploadError) -> String {
    snafu::ErrorCompat::iter_chain(e)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
