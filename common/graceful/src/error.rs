use thiserror::Error;

#[derive(Error, Debug)]
pub enum GracefulError {
    #[error("failed to install {signal} handler: {error}")]
    SignalInstall {
        signal: &'static str,
        error: std::io::Error,
    },
}
