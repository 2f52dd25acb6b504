//! Graceful shutdown for long running services.
//!
//! A [`Coordinator`] waits for the first termination signal (SIGHUP, SIGINT,
//! SIGTERM, SIGQUIT) or for an explicit [`ShutdownTrigger::trigger`] call, then
//! runs a caller supplied teardown under a [`Deadline`]. Once the teardown
//! returns, every task parked on [`ShutdownWait::wait`] is released, exactly once.
//!
//! ```no_run
//! use std::time::Duration;
//! use graceful::{Coordinator, Deadline};
//!
//! # async fn example() -> Result<(), graceful::GracefulError> {
//! let (wait, trigger) = Coordinator::new(Duration::from_secs(10)).start(
//!     |deadline: Deadline| async move {
//!         // close listeners and connections before deadline.instant()
//!         Ok::<(), std::io::Error>(())
//!     },
//! )?;
//!
//! // ... hand `trigger` to whoever may need to stop the service
//! # trigger.trigger();
//! wait.wait().await;
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod error;
mod signals;

pub use coordinator::{
    Coordinator, Deadline, SecondSignal, ShutdownPhase, ShutdownReason, ShutdownTrigger,
    ShutdownWait,
};
pub use error::GracefulError;
pub use signals::{signal_channel, ChannelSignals, OsSignals, SignalSource};
