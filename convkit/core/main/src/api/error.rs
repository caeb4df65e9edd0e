use thiserror::Error;

pub type ConvResult<T> = Result<T, ConvError>;

#[derive(Debug, Error)]
pub enum ConvError {
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Buffer size mismatch for {what}: expected {expected}, got {actual}")]
    BufferSize {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Alignment error: {0}")]
    Alignment(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}
