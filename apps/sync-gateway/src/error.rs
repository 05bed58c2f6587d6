use std::fmt;

/// Gateway-level error taxonomy.
///
/// Every per-message failure maps onto one of these variants; the wire `code`
/// is what clients see in error payloads. Variants marked silent are never
/// answered with an error frame — the connection is simply scheduled to
/// close, because a malformed or incompatible peer cannot be trusted to
/// handle one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Client version below the supported floor, or unparsable.
    UnsupportedClient,
    /// Operation attempted without a prior successful join.
    NotInSpace { space_id: String },
    /// The authorization collaborator rejected the access.
    AccessDenied { space_id: String },
    /// Diff requested for a document that does not exist.
    DocNotFound { doc_id: String },
    /// The workspace document is flagged closed for edits.
    UpdateBlocked { doc_id: String },
    /// Too many connects from one source address inside the window.
    RateLimited { count: u64 },
    /// A request payload could not be decoded.
    BadRequest { reason: String },
    /// The storage collaborator failed.
    Storage { reason: String },
    /// Anything else; never expected during normal operation.
    Internal { reason: String },
}

impl SyncError {
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    /// Stable wire code for error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedClient => "unsupported-client",
            Self::NotInSpace { .. } => "not-in-space",
            Self::AccessDenied { .. } => "access-denied",
            Self::DocNotFound { .. } => "doc-not-found",
            Self::UpdateBlocked { .. } => "update-blocked",
            Self::RateLimited { .. } => "rate-limited",
            Self::BadRequest { .. } => "bad-request",
            Self::Storage { .. } => "storage-error",
            Self::Internal { .. } => "internal-error",
        }
    }

    /// Errors that close the connection without an error frame.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::UnsupportedClient | Self::RateLimited { .. })
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedClient => write!(f, "client version is not supported"),
            Self::NotInSpace { space_id } => write!(f, "not joined to space {space_id}"),
            Self::AccessDenied { space_id } => write!(f, "access denied for space {space_id}"),
            Self::DocNotFound { doc_id } => write!(f, "document {doc_id} not found"),
            Self::UpdateBlocked { doc_id } => write!(f, "document {doc_id} is blocked for updates"),
            Self::RateLimited { count } => write!(f, "rate limit exceeded ({count} connects)"),
            Self::BadRequest { reason } => write!(f, "bad request: {reason}"),
            Self::Storage { reason } => write!(f, "storage error: {reason}"),
            Self::Internal { reason } => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for SyncError {}
