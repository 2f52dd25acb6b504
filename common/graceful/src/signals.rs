use async_trait::async_trait;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

use crate::GracefulError;

/// A stream of termination signals, identified by name.
#[async_trait]
pub trait SignalSource: Send + 'static {
    /// Waits for the next signal. `None` means no more signals will arrive.
    async fn recv(&mut self) -> Option<&'static str>;
}

/// SIGHUP, SIGINT, SIGTERM and SIGQUIT, all handled the same way.
pub struct OsSignals {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl OsSignals {
    /// Must be called from within a tokio runtime.
    pub fn install() -> Result<Self, GracefulError> {
        Ok(Self {
            hangup: install(SignalKind::hangup(), "SIGHUP")?,
            interrupt: install(SignalKind::interrupt(), "SIGINT")?,
            terminate: install(SignalKind::terminate(), "SIGTERM")?,
            quit: install(SignalKind::quit(), "SIGQUIT")?,
        })
    }
}

fn install(kind: SignalKind, name: &'static str) -> Result<Signal, GracefulError> {
    signal(kind).map_err(|error| GracefulError::SignalInstall {
        signal: name,
        error,
    })
}

#[async_trait]
impl SignalSource for OsSignals {
    async fn recv(&mut self) -> Option<&'static str> {
        tokio::select! {
            Some(()) = self.hangup.recv() => Some("SIGHUP"),
            Some(()) = self.interrupt.recv() => Some("SIGINT"),
            Some(()) = self.terminate.recv() => Some("SIGTERM"),
            Some(()) = self.quit.recv() => Some("SIGQUIT"),
            else => None,
        }
    }
}

/// In-process signal source, fed through the sender returned by [`signal_channel`].
pub struct ChannelSignals {
    receiver: mpsc::UnboundedReceiver<&'static str>,
}

pub fn signal_channel() -> (mpsc::UnboundedSender<&'static str>, ChannelSignals) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (sender, ChannelSignals { receiver })
}

#[async_trait]
impl SignalSource for ChannelSignals {
    async fn recv(&mut self) -> Option<&'static str> {
        self.receiver.recv().await
    }
}
