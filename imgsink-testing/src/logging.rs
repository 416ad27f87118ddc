//! Per-test log capture, so each test's output isn't interleaved with its neighbors'.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Filter used when `RUST_LOG` isn't set.  Connection-level chatter from the HTTP and TLS stacks
/// drowns out everything else at `debug`.
const DEFAULT_FILTER: &str = "hyper=info,hyper_util=info,rustls=info,tower_http=debug,debug";

/// Collects formatted log lines in memory until the test is over
#[derive(Clone, Default)]
struct CapturedLog {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLog {
    /// Take everything logged so far.  Invalid UTF-8 is replaced, since log lines can quote
    /// request bodies.
    fn drain(&self) -> String {
        let buffer = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl<'a> Write for &'a CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

/// Run an async test on its own tokio runtime, with its own `tracing` subscriber.
///
/// Use this instead of `#[tokio::test]` whenever the test starts a server.  The subscriber is
/// installed as the thread default on every worker thread of the runtime, so events from spawned
/// listener and connection tasks are attributed to this test and no other.  Everything logged is
/// printed when the test ends, whether it passed, failed or panicked, so `cargo test` shows it
/// only for failures.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let log = CapturedLog::default();

    let dispatch = {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::{fmt, EnvFilter};

        let format = fmt::layer()
            .with_level(true)
            // Filters match on targets, so they're worth seeing
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(false)
            .with_writer(log.clone());

        let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;

        Arc::new(tracing::Dispatch::new(
            tracing_subscriber::registry().with(filter).with(format),
        ))
    };

    std::thread_local! {
        static WORKER_DISPATCH: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
    }

    tracing::dispatcher::with_default(&dispatch, || {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("imgsink-test");

        let start_dispatch = dispatch.clone();
        builder.on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&start_dispatch);
            WORKER_DISPATCH.with(|cell| cell.replace(Some(guard)));
        });
        builder.on_thread_stop(|| {
            WORKER_DISPATCH.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        // A panicking test re-throws below, so nothing observes the runtime in a broken state
        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", log.drain());

        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
