use thiserror::Error;

use adjutant_providers::ProviderError;
use adjutant_store::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Signature mismatch on ingest; the event is dropped and logged.
    #[error("unauthorized event")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("platform error: {0}")]
    Platform(#[from] anyhow::Error),

    /// Proactive budget used up for the day; the scheduler sleeps.
    #[error("proactive budget exhausted")]
    BudgetExhausted,

    #[error("job {0} has no classification")]
    MissingClassification(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
