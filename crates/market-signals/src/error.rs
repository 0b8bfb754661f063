use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("Not enough candles: need {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("Invalid candle at index {index}")]
    InvalidCandle { index: usize },

    #[error("Indicator error: {0}")]
    Indicator(String),
}

impl SignalError {
    pub(crate) fn indicator(err: ta::errors::TaError) -> Self {
        SignalError::Indicator(format!("{:?}", err))
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;
