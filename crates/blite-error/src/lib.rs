//! Error taxonomy shared by every BLite crate.
//!
//! One public enum, one variant per failure kind the engine can surface.
//! Components never define private error types; they construct these
//! variants directly so the taxonomy stays closed.

use std::fmt;

/// Convenient result alias used across the workspace.
pub type Result<T, E = BliteError> = std::result::Result<T, E>;

/// Every error the storage engine can return to a caller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BliteError {
    /// File header or page does not match the expected layout.
    #[error("invalid database format: {reason}")]
    InvalidFormat {
        /// Human-readable description of the mismatch.
        reason: String,
    },

    /// Another process holds the exclusive file lock.
    #[error("database file is already open in another process")]
    AlreadyOpen,

    /// Access past the allocated page range.
    #[error("page {page_id} is out of range (allocated pages: {allocated})")]
    PageOutOfRange {
        /// Offending page id.
        page_id: u32,
        /// Number of pages currently allocated.
        allocated: u32,
    },

    /// Stored page CRC does not match the recomputed value.
    #[error("checksum mismatch on page {page_id}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Page whose body failed validation.
        page_id: u32,
        /// Checksum read from the page header.
        stored: u32,
        /// Checksum recomputed over the page body.
        computed: u32,
    },

    /// Document bytes violate the C-BSON framing rules.
    #[error("malformed document: {reason}")]
    MalformedDocument {
        /// What the decoder tripped over.
        reason: String,
    },

    /// Element carries a type code outside the supported set.
    #[error("unknown BSON type code {code:#04x}")]
    UnknownTypeCode {
        /// The unrecognized code byte.
        code: u8,
    },

    /// Field id (or name) absent from the field-name schema.
    #[error("unknown field: {field}")]
    UnknownField {
        /// Field id rendered as text, or the field name itself.
        field: String,
    },

    /// Unique-index violation. The owning transaction stays Active.
    #[error("duplicate key in unique index {index}")]
    DuplicateKey {
        /// Name of the violated index.
        index: String,
    },

    /// Missing document, collection, or index key. Non-fatal.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A collection with the same name already exists.
    #[error("collection already exists: {name}")]
    Exists {
        /// The colliding collection name.
        name: String,
    },

    /// Caller-provided encode buffer is too small.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes the encoder required.
        needed: usize,
        /// Bytes the caller supplied.
        available: usize,
    },

    /// Encoded document exceeds the configured hard ceiling.
    #[error("document of {size} bytes exceeds the {limit}-byte limit")]
    DocumentTooLarge {
        /// Encoded size of the rejected document.
        size: usize,
        /// Configured `max_document_bytes`.
        limit: usize,
    },

    /// The transaction cannot continue from its current state.
    #[error("transaction conflict: {reason}")]
    TransactionConflict {
        /// Which state transition was rejected.
        reason: String,
    },

    /// Cooperative cancellation fired; durable state is unchanged.
    #[error("operation cancelled")]
    Cancelled,

    /// Underlying file or OS failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Broken internal invariant. Always a bug.
    #[error("internal error: {reason}")]
    Internal {
        /// Which invariant broke.
        reason: String,
    },
}

impl BliteError {
    /// Build an [`BliteError::InvalidFormat`] from anything displayable.
    pub fn invalid_format(reason: impl fmt::Display) -> Self {
        Self::InvalidFormat {
            reason: reason.to_string(),
        }
    }

    /// Build a [`BliteError::MalformedDocument`] from anything displayable.
    pub fn malformed(reason: impl fmt::Display) -> Self {
        Self::MalformedDocument {
            reason: reason.to_string(),
        }
    }

    /// Build a [`BliteError::NotFound`] from anything displayable.
    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound {
            what: what.to_string(),
        }
    }

    /// Build a [`BliteError::TransactionConflict`] from anything displayable.
    pub fn conflict(reason: impl fmt::Display) -> Self {
        Self::TransactionConflict {
            reason: reason.to_string(),
        }
    }

    /// Build a [`BliteError::Internal`] from anything displayable.
    pub fn internal(reason: impl fmt::Display) -> Self {
        Self::Internal {
            reason: reason.to_string(),
        }
    }

    /// True for errors that abort an in-flight commit (I/O and cancellation).
    #[must_use]
    pub const fn aborts_commit(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Cancelled)
    }
}
