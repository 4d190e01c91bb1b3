use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("invalid process topology: {0}")]
    Topology(String),
    #[error("collective operation failed: {0}")]
    Collective(String),
    #[error("dataset error: {0}")]
    Data(String),
    #[error("{0} loader yielded no batches")]
    EmptyLoader(&'static str),
    #[error("initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        TrainingError::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        TrainingError::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        TrainingError::Validation(messages)
    }

    pub fn topology(message: impl Into<String>) -> Self {
        TrainingError::Topology(message.into())
    }

    pub fn collective(message: impl Into<String>) -> Self {
        TrainingError::Collective(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        TrainingError::Data(message.into())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
