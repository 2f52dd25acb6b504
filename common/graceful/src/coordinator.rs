use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{error::Elapsed, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::signals::{OsSignals, SignalSource};
use crate::GracefulError;

/// Where the shutdown sequence currently stands. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownPhase {
    Idle = 0,
    Requested = 1,
    Draining = 2,
    Done = 3,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownPhase::Idle,
            1 => ShutdownPhase::Requested,
            2 => ShutdownPhase::Draining,
            _ => ShutdownPhase::Done,
        }
    }
}

/// What to do with a termination signal arriving while a shutdown is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecondSignal {
    /// Log and call the force exit hook, `std::process::exit(1)` unless overridden.
    #[default]
    ForceExit,
    /// Log and keep draining.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    Triggered,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "signal {name}"),
            ShutdownReason::Triggered => f.write_str("trigger"),
        }
    }
}

/// Point in time by which the teardown is expected to have returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    instant: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            instant: Instant::now() + timeout,
        }
    }

    pub fn instant(&self) -> Instant {
        self.instant
    }

    pub fn remaining(&self) -> Duration {
        self.instant.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.instant
    }

    /// Resolves once the deadline is reached.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.instant).await
    }

    /// Runs `future` until it completes or the deadline is reached.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, Elapsed> {
        tokio::time::timeout_at(self.instant, future).await
    }
}

struct State {
    phase: AtomicU8,
    requested: CancellationToken,
    // Cancelling a token twice is a no-op, so `finished` can only ever be released once.
    finished: CancellationToken,
}

impl State {
    fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn advance(&self, phase: ShutdownPhase) {
        self.phase.fetch_max(phase as u8, Ordering::SeqCst);
    }
}

/// Requests the shutdown from within the application. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownTrigger {
    state: Arc<State>,
}

impl ShutdownTrigger {
    /// Starts the shutdown, unless it has already started. Safe to call
    /// concurrently and repeatedly.
    pub fn trigger(&self) {
        if self.state.phase() == ShutdownPhase::Done {
            debug!("graceful: shutdown already finished, ignoring trigger");
            return;
        }
        self.state.requested.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.state.requested.is_cancelled()
    }
}

/// Blocks until the teardown has returned. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownWait {
    state: Arc<State>,
}

impl ShutdownWait {
    pub async fn wait(&self) {
        self.state.finished.cancelled().await
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.state.phase()
    }

    /// True as soon as a signal or a trigger has been received.
    pub fn is_shutting_down(&self) -> bool {
        self.state.requested.is_cancelled() || self.phase() != ShutdownPhase::Idle
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.is_cancelled()
    }

    /// Future resolving once shutdown has been requested, to hand over to a
    /// server's graceful shutdown hook.
    pub fn requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.state.requested.clone();
        async move { token.cancelled().await }
    }
}

type ForceExit = Arc<dyn Fn() + Send + Sync>;

/// Builder for the shutdown sequence, see [`Coordinator::start`].
pub struct Coordinator {
    name: String,
    timeout: Duration,
    trap_signals: bool,
    signal_source: Option<Box<dyn SignalSource>>,
    second_signal: SecondSignal,
    force_exit: ForceExit,
}

impl Coordinator {
    /// `timeout` bounds the teardown: it is handed over as a [`Deadline`].
    pub fn new(timeout: Duration) -> Self {
        Self {
            name: "app".to_owned(),
            timeout,
            trap_signals: true,
            signal_source: None,
            second_signal: SecondSignal::default(),
            force_exit: Arc::new(|| std::process::exit(1)),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    /// Listen for OS termination signals (default: true).
    pub fn with_trap_signals(mut self, trap_signals: bool) -> Self {
        self.trap_signals = trap_signals;
        self
    }

    /// Replaces the OS signals with another source.
    pub fn with_signal_source<S: SignalSource>(mut self, source: S) -> Self {
        self.signal_source = Some(Box::new(source));
        self.trap_signals = true;
        self
    }

    pub fn with_second_signal(mut self, second_signal: SecondSignal) -> Self {
        self.second_signal = second_signal;
        self
    }

    /// Called instead of `std::process::exit(1)` when a second signal forces the exit.
    pub fn with_force_exit<F>(mut self, force_exit: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.force_exit = Arc::new(force_exit);
        self
    }

    /// Spawns the shutdown sequence and returns immediately.
    ///
    /// `teardown` runs once, on a background task, after the first signal or
    /// trigger. It is never aborted: when it takes longer than the timeout, it
    /// is its own job to watch the deadline and return. Its error is logged,
    /// and does not prevent waiters from being released.
    pub fn start<F, Fut, E>(
        self,
        teardown: F,
    ) -> Result<(ShutdownWait, ShutdownTrigger), GracefulError>
    where
        F: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let signals = match (self.trap_signals, self.signal_source) {
            (false, _) => None,
            (true, Some(source)) => Some(source),
            (true, None) => {
                let source: Box<dyn SignalSource> = Box::new(OsSignals::install()?);
                Some(source)
            }
        };

        let state = Arc::new(State {
            phase: AtomicU8::new(ShutdownPhase::Idle as u8),
            requested: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        let sequence = Sequence {
            name: self.name,
            timeout: self.timeout,
            second_signal: self.second_signal,
            force_exit: self.force_exit,
            state: state.clone(),
        };
        tokio::spawn(sequence.run(signals, teardown));

        Ok((
            ShutdownWait {
                state: state.clone(),
            },
            ShutdownTrigger { state },
        ))
    }
}

struct Sequence {
    name: String,
    timeout: Duration,
    second_signal: SecondSignal,
    force_exit: ForceExit,
    state: Arc<State>,
}

impl Sequence {
    async fn run<F, Fut, E>(self, mut signals: Option<Box<dyn SignalSource>>, teardown: F)
    where
        F: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let reason = self.wait_for_request(&mut signals).await;
        self.state.requested.cancel();
        self.state.advance(ShutdownPhase::Requested);
        info!(app = %self.name, reason = %reason, "graceful: shutdown requested");

        // From here on, further signals are not a request to shut down anymore.
        let watcher = signals.map(|source| {
            tokio::spawn(watch_second_signal(
                source,
                self.second_signal,
                self.force_exit.clone(),
            ))
        });

        let deadline = Deadline::after(self.timeout);
        self.state.advance(ShutdownPhase::Draining);
        info!(
            app = %self.name,
            timeout_secs = self.timeout.as_secs_f64(),
            "graceful: shutting down..."
        );

        let started = Instant::now();
        let outcome = tokio::spawn(teardown(deadline)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(())) => info!(
                app = %self.name,
                duration_secs = elapsed.as_secs_f64(),
                "graceful: shutdown finished"
            ),
            Ok(Err(err)) => error!(
                app = %self.name,
                duration_secs = elapsed.as_secs_f64(),
                error = %err,
                "graceful: shutdown failed"
            ),
            Err(err) => error!(
                app = %self.name,
                duration_secs = elapsed.as_secs_f64(),
                error = %err,
                "graceful: shutdown panicked"
            ),
        }

        if elapsed > self.timeout {
            warn!(
                app = %self.name,
                duration_secs = elapsed.as_secs_f64(),
                overrun_secs = (elapsed - self.timeout).as_secs_f64(),
                "graceful: shutdown overran its deadline"
            );
        }

        if let Some(watcher) = watcher {
            watcher.abort();
        }

        self.state.advance(ShutdownPhase::Done);
        self.state.finished.cancel();
    }

    async fn wait_for_request(
        &self,
        signals: &mut Option<Box<dyn SignalSource>>,
    ) -> ShutdownReason {
        if let Some(source) = signals.as_mut() {
            tokio::select! {
                _ = self.state.requested.cancelled() => return ShutdownReason::Triggered,
                signal = source.recv() => {
                    if let Some(name) = signal {
                        return ShutdownReason::Signal(name);
                    }
                    debug!(app = %self.name, "graceful: signal source closed");
                }
            }
        }
        self.state.requested.cancelled().await;
        ShutdownReason::Triggered
    }
}

async fn watch_second_signal(
    mut source: Box<dyn SignalSource>,
    policy: SecondSignal,
    force_exit: ForceExit,
) {
    while let Some(signal) = source.recv().await {
        match policy {
            SecondSignal::ForceExit => {
                error!(
                    signal,
                    "graceful: signal received during shutdown, forcing exit"
                );
                force_exit();
                return;
            }
            SecondSignal::Ignore => {
                warn!(signal, "graceful: shutdown already in progress, signal ignored")
            }
        }
    }
}
