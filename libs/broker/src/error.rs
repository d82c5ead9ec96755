use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Broker is not running")]
    Stopped,

    #[error("Transport error: {0}")]
    Fabric(#[from] courier_fabric::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] courier_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
