// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::port::TransportError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] crate::port::SpawnError),

    #[error("Terminate error: {0}")]
    Terminate(#[from] crate::port::TerminateError),

    #[error("Feed error: {0}")]
    Feed(#[from] crate::port::FeedError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Handler error: {0:#}")]
    Handler(anyhow::Error),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
