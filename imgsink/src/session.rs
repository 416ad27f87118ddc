//! The upload session: the single piece of state shared by every request this server handles.
//!
//! A session admits at most one upload over its whole lifetime.  Every read and write of the
//! session's phase happens under one mutex, which is only ever held for the duration of a state
//! check or assignment and never across I/O.
use crate::completion::{Completion, Outcome};
use crate::{error, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Where the session is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for an upload
    Idle,

    /// An upload was admitted and its body is being read
    Uploading,

    /// The body has been consumed and validated, and the rest of the processing is running in
    /// the background
    Processing,

    /// The upload is complete.  Terminal.
    Done { preallocation_applied: bool },

    /// The upload failed.  Terminal; the server is on its way out.
    Failed,
}

/// Transitions out of an admitted phase.  Admission itself happens in [`UploadSession::admit`].
#[derive(Clone, Copy, Debug)]
enum Event {
    Release,
    BeginProcessing,
    Succeed { preallocation_applied: bool },
    Fail,
}

impl Phase {
    /// The phase that follows `event`, or `None` if `event` can't happen in this phase
    fn next(self, event: Event) -> Option<Phase> {
        use Phase::*;

        match (self, event) {
            (Uploading, Event::Release) => Some(Idle),
            (Uploading, Event::BeginProcessing) => Some(Processing),
            (
                Uploading | Processing,
                Event::Succeed {
                    preallocation_applied,
                },
            ) => Some(Done {
                preallocation_applied,
            }),
            (Uploading | Processing, Event::Fail) => Some(Failed),
            _ => None,
        }
    }
}

/// Who is on the other end of a connection, as far as the transport could tell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerIdentity {
    /// Plain HTTP; there is no identity to check
    Plaintext,

    /// TLS, with the subject common names of the certificates the client presented
    Tls { common_names: Vec<String> },
}

impl PeerIdentity {
    /// Check this peer against the expected client common name.
    ///
    /// A TLS peer is accepted only if one of its certificates carries `expected`.  Without an
    /// expected name there is nothing to enforce.
    pub fn authorize(&self, expected: Option<&str>) -> Result<()> {
        match (self, expected) {
            (Self::Plaintext, _) => {
                debug!("Handling plaintext HTTP connection");
                Ok(())
            }
            (Self::Tls { .. }, None) => Ok(()),
            (Self::Tls { common_names }, Some(expected)) => {
                if common_names.iter().any(|name| name == expected) {
                    Ok(())
                } else {
                    warn!(
                        ?common_names,
                        expected, "Rejecting client certificate with unexpected common name"
                    );
                    error::UnauthorizedSnafu { expected }.fail()
                }
            }
        }
    }
}

/// The state of the one upload this server will ever accept
#[derive(Debug)]
pub struct UploadSession {
    phase: Mutex<Phase>,
    client_name: Option<String>,
    completion: Completion,
}

impl UploadSession {
    pub(crate) fn new(client_name: Option<String>, completion: Completion) -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
            client_name,
            completion,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.lock()
    }

    /// Whether the destination had its full size reserved.  `false` until the upload is done.
    pub fn preallocation_applied(&self) -> bool {
        matches!(
            self.phase(),
            Phase::Done {
                preallocation_applied: true
            }
        )
    }

    /// Decide whether a request from `peer` may start uploading.
    ///
    /// The peer is checked first, then the phase.  Only an idle session admits; the returned
    /// ticket is the admitted request's claim on the session.
    pub(crate) fn admit(self: &Arc<Self>, peer: &PeerIdentity) -> Result<AdmissionTicket> {
        peer.authorize(self.client_name.as_deref())?;

        let mut phase = self.lock();

        match *phase {
            Phase::Idle => {
                *phase = Phase::Uploading;

                Ok(AdmissionTicket {
                    session: self.clone(),
                    resolved: false,
                })
            }
            Phase::Uploading | Phase::Processing => {
                warn!("Got concurrent upload request");
                error::ConcurrentUploadSnafu.fail()
            }
            Phase::Done { .. } | Phase::Failed => {
                warn!("Got upload request after the upload is already done");
                error::AlreadyDoneSnafu.fail()
            }
        }
    }

    fn apply(&self, event: Event) {
        let mut phase = self.lock();

        match phase.next(event) {
            Some(next) => {
                debug!(from = ?*phase, to = ?next, "Upload session transition");
                *phase = next;
            }
            None => {
                error!(phase = ?*phase, ?event, "Ignoring impossible upload session transition");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        // Every critical section is a single assignment, so a poisoned lock still holds a
        // consistent phase
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof that a request was admitted into the session.
///
/// Exactly one ticket exists per session.  It must be resolved with one of its consuming methods;
/// a ticket dropped while still uploading gives the session back to the next request, and one
/// dropped while processing fails the session.
#[must_use]
#[derive(Debug)]
pub(crate) struct AdmissionTicket {
    session: Arc<UploadSession>,
    resolved: bool,
}

impl AdmissionTicket {
    /// Give up the admission without having processed anything, so another request can try.
    pub(crate) fn release(mut self) {
        self.resolved = true;
        self.session.apply(Event::Release);
    }

    /// Report the result of a synchronous upload.
    ///
    /// A failure is terminal: the session won't admit anything else, and the failure is reported
    /// to the run loop as fatal.
    pub(crate) fn finish_sync(mut self, result: Result<bool>) {
        self.finish(result);
    }

    /// The upload body has been consumed; the rest of the work continues in the background.
    pub(crate) fn begin_processing(&mut self) {
        self.session.apply(Event::BeginProcessing);
    }

    /// Report the result of the background half of an async upload.
    pub(crate) fn finish_async(mut self, result: Result<bool>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<bool>) {
        self.resolved = true;

        match result {
            Ok(preallocation_applied) => {
                self.session.apply(Event::Succeed {
                    preallocation_applied,
                });
                info!(preallocation_applied, "Upload complete");

                self.session.completion.fire(Outcome::Done);
            }
            Err(e) => {
                self.session.apply(Event::Fail);
                error!(error = %e, "Upload failed");

                self.session.completion.fire(Outcome::Fatal(e));
            }
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }

        match self.session.phase() {
            Phase::Uploading => {
                warn!("Upload abandoned before processing started");
                self.session.apply(Event::Release);
            }
            Phase::Processing => {
                self.finish(error::ProcessingAbandonedSnafu.fail());
            }
            Phase::Idle | Phase::Done { .. } | Phase::Failed => {}
        }
    }
}
