//! Runs the controller's long-lived tasks together and tears them down together.
use crate::error::{self, Error, Result};

use futures::{stream::FuturesUnordered, StreamExt};
use snafu::ResultExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{event, Level};

/// A cloneable handle on the process-wide shutdown signal.
#[derive(Clone, Debug)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Shutdown {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Signals every holder of this handle to stop. Triggering more than once has no further effect.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any handle, so this cannot fail while we hold `self`.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}

/// A named, long-running task.
pub type Task<'a> = (&'static str, Pin<Box<dyn Future<Output = Result<()>> + 'a>>);

pub fn task<'a, F>(name: &'static str, future: F) -> Task<'a>
where
    F: Future<Output = Result<()>> + 'a,
{
    (name, Box::pin(future))
}

/// Runs every task concurrently until all have exited.
///
/// The first task to exit, for whatever reason, triggers shutdown, as does SIGTERM or SIGINT. Every task is
/// expected to observe `shutdown` and return. The first error returned by any task is returned.
pub async fn run_all(tasks: Vec<Task<'_>>, shutdown: Shutdown) -> Result<()> {
    let mut running: FuturesUnordered<_> = tasks
        .into_iter()
        .map(|(name, task)| {
            let shutdown = shutdown.clone();
            async move {
                let result = task.await;
                match &result {
                    Ok(()) => event!(Level::INFO, task = name, "Task exited."),
                    Err(err) => event!(Level::ERROR, task = name, error = %err, "Task failed."),
                }
                shutdown.trigger();
                result
            }
        })
        .collect();

    let collect_results = async {
        let mut first_error: Option<Error> = None;
        while let Some(result) = running.next().await {
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error
    };

    let signals = async {
        tokio::select! {
            signaled = termination_signal() => {
                if let Err(err) = signaled {
                    event!(Level::ERROR, "{}", err);
                }
                shutdown.trigger();
            }
            _ = shutdown.wait() => {}
        }
    };

    let (first_error, ()) = futures::join!(collect_results, signals);
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Completes when the process is asked to terminate.
async fn termination_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context(error::SignalHandlerSnafu)?;
    tokio::select! {
        _ = sigterm.recv() => {
            event!(Level::INFO, "Received SIGTERM, shutting down.");
        }
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context(error::SignalHandlerSnafu)?;
            event!(Level::INFO, "Received SIGINT, shutting down.");
        }
    }
    Ok(())
}
