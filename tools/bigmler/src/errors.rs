use thiserror::Error;

#[derive(Debug, Error)]
pub enum BigmlerError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("corrupt log: {0}")]
    CorruptLog(String),
    #[error("remote error for {resource_id}: {message}")]
    Remote {
        resource_id: String,
        message: String,
    },
    #[error("api error: {0}")]
    Api(String),
    #[error("timed out waiting for {resource_id}")]
    Timeout { resource_id: String },
}

/// Input problems caught before any remote call is issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("You should provide a description to publish.")]
    MissingDescription,
    #[error(
        "When --max-categories is used, you must also provide the --objective \
         field name or column number"
    )]
    MissingObjective,
    #[error(
        "To use --new-fields you must also provide a dataset id to generate \
         the new dataset from it."
    )]
    MissingDatasetForNewFields,
    #[error("{0}")]
    InvalidValue(String),
}
