//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Mainline node crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Node ids and info hashes must be exactly 20 bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// XOR distance is only defined between identifiers of the same length.
    #[error("Id length mismatch: {0} != {1}")]
    IdLengthMismatch(usize, usize),

    /// Indicates that the message transaction_id is not two bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    /// A bencoded dictionary that is not a valid K-RPC message.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Compact peer info must be 6 bytes, and compact node info 26 bytes.
    #[error("Invalid compact address length: {0}")]
    InvalidCompactAddress(usize),
}
