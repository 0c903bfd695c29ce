use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Undecodable transaction: {0}")]
    Transaction(String),

    #[error("Unsupported address: {0}")]
    Address(String),

    #[error("Integer out of range: {0} bytes")]
    IntegerOverflow(usize),

    #[error("Invalid plutus data: {0}")]
    PlutusData(String),
}
