pub mod api;
pub mod config;
pub mod handlers;

pub use api::{Api, ApiError};
