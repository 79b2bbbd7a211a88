//! Termination multiplexing: one task owns the `terminate` broadcast and is
//! the only thing allowed to close it. Every other holder only subscribes.
//!
//! Four sources can trigger a close: SIGINT/SIGQUIT/SIGTERM/SIGHUP, the
//! caller's own cancellation token, the first `Some` error on the shared
//! error channel, and an explicit in-process `terminate_now()` call.

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A cheap handle any task can use to request termination without racing
/// the multiplexer for ownership of the channel: it just sends on an mpsc,
/// same as a stage failure would.
#[derive(Clone)]
pub struct TerminateHandle {
    tx: mpsc::Sender<Option<String>>,
}

impl TerminateHandle {
    pub async fn terminate_now(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Some(reason.into())).await;
    }
}

/// The subscribe side of the broadcast, held independently of the
/// multiplexer task so callers can keep minting new `broadcast::Receiver`s
/// for stages dispatched in later waves after the multiplexer itself has
/// been handed off to its own task.
#[derive(Clone)]
pub struct TerminateSubscriber(broadcast::Sender<()>);

impl TerminateSubscriber {
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.0.subscribe()
    }
}

/// Owns the broadcast channel's closing side. Constructed once per run by
/// the supervisor; `run_until_terminated` consumes it.
pub struct TerminationMultiplexer {
    terminate_tx: broadcast::Sender<()>,
    error_tx: mpsc::Sender<Option<String>>,
    error_rx: mpsc::Receiver<Option<String>>,
    cancellation: CancellationToken,
}

impl TerminationMultiplexer {
    /// `capacity` should be at least the number of concurrently dispatched
    /// stages so no stage task blocks trying to report its own failure.
    pub fn new(capacity: usize, cancellation: CancellationToken) -> Self {
        let (terminate_tx, _) = broadcast::channel(1);
        let (error_tx, error_rx) = mpsc::channel(capacity.max(1));
        Self {
            terminate_tx,
            error_tx,
            error_rx,
            cancellation,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.terminate_tx.subscribe()
    }

    /// A cloneable handle that keeps working after `self` is moved into
    /// `run_until_terminated`'s task.
    pub fn subscriber(&self) -> TerminateSubscriber {
        TerminateSubscriber(self.terminate_tx.clone())
    }

    /// A handle stage tasks use to report their own terminal error; sending
    /// `None` is a clean "this stage succeeded, nothing to report".
    pub fn handle(&self) -> TerminateHandle {
        TerminateHandle {
            tx: self.error_tx.clone(),
        }
    }

    /// Drive the multiplexer until one of the four sources fires, then
    /// broadcast-close `terminate` and return the first reported error, if
    /// any. Consumes `self` — a run has exactly one of these.
    pub async fn run_until_terminated(mut self) -> Option<String> {
        #[cfg(unix)]
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        #[cfg(unix)]
        let mut sigquit = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())
            .expect("failed to install SIGQUIT handler");
        #[cfg(unix)]
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to install SIGHUP handler");

        let reason = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received SIGINT, terminating run");
                Some("interrupted (SIGINT)".to_string())
            }
            #[cfg(unix)]
            _ = sigterm.recv() => {
                warn!("received SIGTERM, terminating run");
                Some("terminated (SIGTERM)".to_string())
            }
            #[cfg(unix)]
            _ = sigquit.recv() => {
                warn!("received SIGQUIT, terminating run");
                Some("quit (SIGQUIT)".to_string())
            }
            #[cfg(unix)]
            _ = sighup.recv() => {
                warn!("received SIGHUP, terminating run");
                Some("hangup (SIGHUP)".to_string())
            }
            _ = self.cancellation.cancelled() => {
                info!("caller cancelled the run");
                Some("cancelled by caller".to_string())
            }
            reported = self.error_rx.recv() => {
                match reported.flatten() {
                    Some(err) => {
                        warn!(error = %err, "stage reported a fatal error, terminating run");
                        Some(err)
                    }
                    None => None,
                }
            }
        };

        // Broadcast-close: the only send anywhere in the system is this one.
        let _ = self.terminate_tx.send(());
        drop(self.terminate_tx);
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_terminate_closes_the_broadcast() {
        let mux = TerminationMultiplexer::new(4, CancellationToken::new());
        let mut sub = mux.subscribe();
        let handle = mux.handle();

        let join = tokio::spawn(mux.run_until_terminated());
        handle.terminate_now("stage failed").await;

        let reason = join.await.unwrap();
        assert_eq!(reason.as_deref(), Some("stage failed"));
        assert!(sub.recv().await.is_ok() || sub.recv().await.is_err());
    }

    #[tokio::test]
    async fn cancellation_token_closes_the_broadcast_with_no_error() {
        let token = CancellationToken::new();
        let mux = TerminationMultiplexer::new(2, token.clone());
        let join = tokio::spawn(mux.run_until_terminated());
        token.cancel();
        let reason = join.await.unwrap();
        assert!(reason.is_none());
    }

    #[tokio::test]
    async fn multiple_subscribers_all_observe_close() {
        let mux = TerminationMultiplexer::new(2, CancellationToken::new());
        let mut sub_a = mux.subscribe();
        let mut sub_b = mux.subscribe();
        let handle = mux.handle();

        tokio::spawn(mux.run_until_terminated());
        handle.terminate_now("x").await;

        assert!(sub_a.recv().await.is_err());
        assert!(sub_b.recv().await.is_err());
    }
}
