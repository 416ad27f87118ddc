//! The upload server: two HTTP listeners and the run loop that decides when they stop.
use crate::adapter::ProcessingContext;
use crate::completion::{Completion, Outcome};
use crate::processor::ProcessorFactory;
use crate::routes::{self, AppState};
use crate::session::{PeerIdentity, UploadSession};
use crate::tls::TlsSettings;
use crate::{error, Config, Result, UploadError};
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use snafu::prelude::*;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// How long to back off after a failure to accept a connection, so that a persistent failure
/// like running out of file descriptors doesn't turn into a busy loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What a successful run of the server reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunReport {
    /// Whether the destination had its full size reserved
    pub preallocation_applied: bool,
}

/// The addresses the listeners actually bound to, which differ from the configured ones when an
/// ephemeral port was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundAddrs {
    pub upload: SocketAddr,
    pub health: SocketAddr,
}

/// Accepts exactly one upload, then shuts itself down.
pub struct UploadServer {
    config: Config,
    state: AppState,
    outcome: oneshot::Receiver<Outcome>,
    bound: watch::Sender<Option<BoundAddrs>>,
}

impl std::fmt::Debug for UploadServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadServer")
            .field("config", &self.config)
            .field("session", &self.state.session)
            .finish_non_exhaustive()
    }
}

impl UploadServer {
    /// Create a server that hands uploads to processors made by `factory`.
    ///
    /// Fails if the configuration is invalid.  Nothing is bound until [`Self::run`].
    pub fn new(config: Config, factory: Arc<dyn ProcessorFactory>) -> Result<Self> {
        config.validate()?;

        let (completion, outcome) = Completion::new();
        let session = Arc::new(UploadSession::new(config.client_name.clone(), completion));
        let context = Arc::new(ProcessingContext::from_config(&config)?);

        let (bound, _) = watch::channel(None);

        Ok(Self {
            config,
            state: AppState {
                session,
                factory,
                context,
            },
            outcome,
            bound,
        })
    }

    /// The upload session, for observing its progress from outside
    pub fn session(&self) -> Arc<UploadSession> {
        self.state.session.clone()
    }

    /// The ingestion router, which can be driven directly without any listener.
    ///
    /// Requests served this way share the session with the listeners.  Requests without a
    /// [`PeerIdentity`] extension are treated as plaintext.
    pub fn router(&self) -> Router {
        routes::upload_router(self.state.clone())
    }

    /// Receiver that will hold the bound listener addresses once [`Self::run`] has bound them
    pub fn bound_addrs(&self) -> watch::Receiver<Option<BoundAddrs>> {
        self.bound.subscribe()
    }

    /// Serve until the upload is done or something fatal happens.
    ///
    /// Either way both listeners are shut down before this returns: first the health listener,
    /// then the ingestion listener, giving in-flight requests up to the configured grace period
    /// to finish.
    #[instrument(skip(self), fields(destination = %self.config.destination.display()))]
    pub async fn run(self) -> Result<RunReport> {
        let tls = TlsSettings::from_config(&self.config)?;

        let upload_addr = SocketAddr::new(self.config.bind_address, self.config.bind_port);
        let health_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.health_port);

        let upload_listener = bind("upload", upload_addr).await?;
        let health_listener = bind("health", health_addr).await?;

        let bound = BoundAddrs {
            upload: upload_listener
                .local_addr()
                .context(error::ListenerSnafu { listener: "upload" })?,
            health: health_listener
                .local_addr()
                .context(error::ListenerSnafu { listener: "health" })?,
        };
        info!(
            upload = %bound.upload,
            health = %bound.health,
            tls = tls.is_some(),
            "Listening"
        );
        self.bound.send_replace(Some(bound));

        let connection_settings = ConnectionSettings {
            header_read_timeout: self.config.header_read_timeout,
            grace_period: self.config.shutdown_grace_period,
        };

        let mut upload = Listener::spawn(
            "upload",
            upload_listener,
            self.router(),
            tls,
            connection_settings,
        );
        let mut health = Listener::spawn(
            "health",
            health_listener,
            routes::health_router(),
            None,
            connection_settings,
        );

        let result = tokio::select! {
            outcome = self.outcome => match outcome {
                Ok(Outcome::Done) => {
                    info!("Shutting down after successful upload");

                    Ok(RunReport {
                        preallocation_applied: self.state.session.preallocation_applied(),
                    })
                }
                Ok(Outcome::Fatal(e)) => {
                    error!(error = %e, "Upload failed; shutting down");

                    Err(e)
                }
                Err(_) => error::CompletionDroppedSnafu.fail(),
            },
            e = upload.exited() => Err(e),
            e = health.exited() => Err(e),
        };

        health.shutdown().await;
        upload.shutdown().await;

        result
    }
}

async fn bind(listener: &'static str, address: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(address).await.context(error::BindSnafu {
        listener,
        address: address.to_string(),
    })
}

#[derive(Clone, Copy, Debug)]
struct ConnectionSettings {
    header_read_timeout: Duration,
    grace_period: Duration,
}

/// A running accept loop
struct Listener {
    name: &'static str,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl Listener {
    fn spawn(
        name: &'static str,
        listener: TcpListener,
        router: Router,
        tls: Option<TlsSettings>,
        settings: ConnectionSettings,
    ) -> Self {
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            accept_loop(listener, router, tls, settings, cancel.clone())
                .instrument(tracing::info_span!("listener", name)),
        );

        Self {
            name,
            cancel,
            task: Some(task),
        }
    }

    /// Resolves if the accept loop ends on its own, which it never should.  Cancel safe.
    async fn exited(&mut self) -> UploadError {
        let Some(task) = self.task.as_mut() else {
            return futures::future::pending().await;
        };

        let result = task.await;
        self.task = None;

        match result {
            Ok(Ok(())) => error::ListenerExitedSnafu {
                listener: self.name,
            }
            .build(),
            Ok(Err(e)) => e,
            Err(e) => UploadError::Spawn { source: e },
        }
    }

    /// Stop accepting, and wait for in-flight connections to finish.  Failures are logged, not
    /// returned, so that shutting down one listener never prevents shutting down the other.
    async fn shutdown(mut self) {
        self.cancel.cancel();

        let Some(task) = self.task.take() else {
            return;
        };

        match task.await {
            Ok(Ok(())) => debug!(listener = self.name, "Listener stopped"),
            Ok(Err(e)) => error!(listener = self.name, error = %e, "Failed to shut down listener"),
            Err(e) => error!(listener = self.name, error = %e, "Listener task failed"),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Router,
    tls: Option<TlsSettings>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) -> Result<()> {
    let connections = TaskTracker::new();
    // Fired once the grace period is over, to drop whatever connections are still open
    let abandon = CancellationToken::new();

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(settings.header_read_timeout);

    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Error accepting connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
            () = cancel.cancelled() => break,
        };

        debug!(%remote_addr, "Accepted connection");

        let router = router.clone();
        let tls = tls.clone();
        let builder = builder.clone();
        let cancel = cancel.clone();
        let abandon = abandon.clone();

        connections.spawn(
            async move {
                let serve = async move {
                    match tls {
                        Some(tls) => {
                            let handshake = tokio::time::timeout(
                                settings.header_read_timeout,
                                tls.accept(stream),
                            );

                            match handshake.await {
                                Ok(Ok((stream, peer))) => {
                                    serve_connection(stream, peer, router, &builder, cancel).await
                                }
                                Ok(Err(e)) => warn!(error = %e, "TLS handshake failed"),
                                Err(_) => warn!("TLS handshake timed out"),
                            }
                        }
                        None => {
                            serve_connection(
                                stream,
                                PeerIdentity::Plaintext,
                                router,
                                &builder,
                                cancel,
                            )
                            .await
                        }
                    }
                };

                tokio::select! {
                    () = serve => {}
                    () = abandon.cancelled() => debug!("Connection abandoned"),
                }
            }
            .instrument(tracing::debug_span!("connection", %remote_addr)),
        );
    }

    // No new connections from here on; let the ones in flight finish
    drop(listener);
    connections.close();

    debug!(
        connections = connections.len(),
        "Waiting for connections to finish"
    );

    if tokio::time::timeout(settings.grace_period, connections.wait())
        .await
        .is_err()
    {
        warn!(
            grace_period = ?settings.grace_period,
            connections = connections.len(),
            "Connections still open after the grace period; abandoning them"
        );

        // Closes their sockets.  Upload handlers run in tasks of their own and aren't affected.
        abandon.cancel();
        connections.wait().await;
    }

    Ok(())
}

/// Serve HTTP on one connection until the client is done or the listener is shutting down.
///
/// Every request on the connection is tagged with the identity of the peer.
async fn serve_connection<S>(
    stream: S,
    peer: PeerIdentity,
    router: Router,
    builder: &http1::Builder,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = router.map_request(move |mut request: http::Request<Incoming>| {
        request.extensions_mut().insert(peer.clone());
        request
    });

    let connection = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        () = cancel.cancelled() => {
            // Finish the request in flight, if any, then close
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        debug!(error = %e, "Connection ended with an error");
    }
}
