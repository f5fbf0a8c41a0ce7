//! Error types for Linkchat

use thiserror::Error;

/// Main error type for Linkchat operations
///
/// Decryption and signature failures are deliberately absent: records that
/// cannot be opened are "not for us" and are dropped, never surfaced.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Invite target or profile could not be resolved
    #[error("Invalid invite: {0}")]
    InvalidInvite(String),

    /// Recipient identity has no published encryption key
    #[error("Invalid contact: {0}")]
    InvalidContact(String),

    /// Conversation record was not found (missing or tombstoned)
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Operation requires group admin rights
    #[error("Not the group admin: {0}")]
    NotGroupAdmin(String),

    /// Error during graph store operations
    #[error("Store error: {0}")]
    Store(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic primitive could not be applied (bad key material)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Public key string is not valid base58 key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Configuration file is malformed or out of range
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ChatError
pub type ChatResult<T> = Result<T, ChatError>;

impl From<postcard::Error> for ChatError {
    fn from(e: postcard::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChatError::InvalidInvite("no profile".to_string());
        assert_eq!(format!("{}", err), "Invalid invite: no profile");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let chat_err: ChatError = io_err.into();
        assert!(matches!(chat_err, ChatError::Io(_)));
    }
}
