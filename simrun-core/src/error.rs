use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimrunError {
    #[error("Did not find executable '{0}'. Make sure it is on the PATH variable of your operating system.")]
    ExecutableNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SimrunError {
    /// Configuration and executable-resolution errors abort a run before
    /// any process is started.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimrunError::ExecutableNotFound(_) | SimrunError::InvalidConfiguration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SimrunError>;
