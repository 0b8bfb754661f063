//! Error types for the trading agent.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("API error: {message}")]
    Api { message: String, status: Option<u16> },

    #[error("Exchange rejected request (code {code}): {message}")]
    Exchange { code: i64, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Decimal, required: Decimal },

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    #[error("Invalid value for setting {key}: {message}")]
    InvalidSetting { key: String, message: String },

    #[error("Signing error: {message}")]
    Signing { message: String },

    #[error("Trading is stopped for user {0}")]
    TradingStopped(String),
}

/// Coarse classification that drives retry and reporting behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network hiccups, rate limits, exchange overload. Retried by the gateway.
    Transient,
    /// Bad input or malformed exchange data. Aborts the single operation.
    Validation,
    /// Not enough balance. A skip, not a failure.
    InsufficientFunds,
    /// Everything else.
    Fatal,
}

/// Binance error codes that indicate a transient condition on their side.
const TRANSIENT_EXCHANGE_CODES: &[i64] = &[
    -1001, // disconnected
    -1003, // too many requests
    -1007, // timeout waiting for backend
    -1008, // server busy
];

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Http(e) => {
                if e.status().map(|s| s.is_client_error() && s.as_u16() != 429).unwrap_or(false) {
                    ErrorKind::Fatal
                } else {
                    ErrorKind::Transient
                }
            }
            Error::WebSocket(_) => ErrorKind::Transient,
            Error::Api { status, .. } => match status {
                Some(429) | Some(418) => ErrorKind::Transient,
                Some(s) if *s >= 500 => ErrorKind::Transient,
                None => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            Error::Exchange { code, .. } if TRANSIENT_EXCHANGE_CODES.contains(code) => {
                ErrorKind::Transient
            }
            Error::Exchange { code: -2019, .. } => ErrorKind::InsufficientFunds,
            Error::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Error::Validation(_)
            | Error::Json(_)
            | Error::UnknownSetting(_)
            | Error::InvalidSetting { .. }
            | Error::TradingStopped(_) => ErrorKind::Validation,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Short text suitable for showing to the account owner.
    ///
    /// Transport detail stays in the logs.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Transient => "exchange temporarily unavailable, will retry".to_string(),
            ErrorKind::InsufficientFunds => "insufficient balance".to_string(),
            ErrorKind::Validation => self.to_string(),
            ErrorKind::Fatal => match self {
                Error::Exchange { message, .. } => format!("order rejected: {message}"),
                _ => "unexpected error, see logs".to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
