#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("input error: {0}")]
    Input(#[from] redis_pubsub_input::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
