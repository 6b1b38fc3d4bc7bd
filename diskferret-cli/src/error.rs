use thiserror::Error;

#[derive(Error, Debug)]
pub enum FerretCliError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("{0}")]
    Attach(#[from] diskferret::block::AttachError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FerretCliError>;
