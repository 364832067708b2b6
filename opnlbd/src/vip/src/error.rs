use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid VIP address: {0}")]
    InvalidAddress(String),

    #[error("VIP pool is empty")]
    EmptyPool,
}
