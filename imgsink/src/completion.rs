//! One-shot reporting of how the upload ended, from whichever task finished it to the server's
//! run loop.
use crate::UploadError;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How an upload session ended
#[derive(Debug)]
pub enum Outcome {
    /// The upload landed in the destination
    Done,

    /// The upload failed in a way that ends this server's useful life
    Fatal(UploadError),
}

/// Sending half of the completion signal.
///
/// Cheap to clone; all clones share the same underlying channel.  Only the first call to
/// [`Completion::fire`] across all clones is delivered.
#[derive(Clone, Debug)]
pub(crate) struct Completion {
    sender: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
}

impl Completion {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (sender, receiver) = oneshot::channel();

        (
            Self {
                sender: Arc::new(Mutex::new(Some(sender))),
            },
            receiver,
        )
    }

    /// Deliver `outcome` to the run loop.  Returns `false` if an outcome was already delivered,
    /// in which case this one is dropped.
    pub(crate) fn fire(&self, outcome: Outcome) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(sender) => {
                if sender.send(outcome).is_err() {
                    // Nobody is listening anymore, which only happens once the server is already
                    // going away
                    debug!("Completion receiver is gone; outcome discarded");
                }

                true
            }
            None => {
                warn!(?outcome, "Upload outcome already reported; ignoring this one");

                false
            }
        }
    }
}
