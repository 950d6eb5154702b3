#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("value {value} is outside of the group")]
    OutsideOfGroup { value: u64 },

    #[error("invalid group: {0}")]
    InvalidGroup(String),

    #[error("exponent {exponent} shares a factor with the group order")]
    NotInvertible { exponent: u64 },
}

pub type Result<T> = std::result::Result<T, CryptoError>;
