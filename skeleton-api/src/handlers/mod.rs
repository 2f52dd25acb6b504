use std::time::Duration;

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::error;

use skeleton_common::context::ServiceContext;
use skeleton_common::probes::{DEFAULT_DB_PROBE_TIMEOUT, DEFAULT_REPLY_WINDOW};

mod app;
mod status;
mod users;

pub use app::app;

#[derive(Clone, Copy, Debug)]
pub struct StatusSettings {
    /// Bound on each database query and broker round trip.
    pub probe_timeout: Duration,
    pub reply_window: Duration,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_DB_PROBE_TIMEOUT,
            reply_window: DEFAULT_REPLY_WINDOW,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub context: ServiceContext,
    pub status: StatusSettings,
    /// Cancelled when the server starts shutting down.
    pub stopping: CancellationToken,
    /// Browser origins allowed by CORS, `*` for any.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(context: ServiceContext, status: StatusSettings) -> Self {
        Self {
            context,
            status,
            stopping: CancellationToken::new(),
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ErrorReply = (StatusCode, Json<ErrorResponse>);

fn error_reply(status: StatusCode, message: impl Into<String>) -> ErrorReply {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn internal_error<E>(err: E) -> ErrorReply
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
