use thiserror::Error;

/// Core error taxonomy shared by every Candela crate.
///
/// Failures cross the tenant façade as values; none of the storage, search or
/// subscription paths panic or throw across the boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Malformed payload: {0}")]
    Structure(String),

    #[error("Invalid resource: {0}")]
    Invalid(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Resource not found: {kind}/{id}")]
    NotFound { kind: String, id: String },

    #[error("Unknown resource kind: {0}")]
    UnknownKind(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Resource conflict: {kind}/{id} already exists")]
    Conflict { kind: String, id: String },

    #[error("Search too costly: {0}")]
    TooCostly(String),

    #[error("Unsupported payload format: {0}")]
    UnsupportedFormat(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn structure(message: impl Into<String>) -> Self {
        Self::Structure(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind(kind.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn conflict(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn too_costly(message: impl Into<String>) -> Self {
        Self::TooCostly(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Abstract error kind used when rendering operation outcomes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Structure(_) | Self::Json(_) => ErrorKind::Structure,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::NotSupported(_) | Self::UnknownKind(_) | Self::UnsupportedFormat(_) => {
                ErrorKind::NotSupported
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Precondition(_) | Self::Conflict { .. } => ErrorKind::BusinessRule,
            Self::TooCostly(_) => ErrorKind::TooCostly,
            Self::Internal(_) => ErrorKind::Exception,
        }
    }

    /// HTTP status code reported on the request boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Structure(_) | Self::Json(_) => 400,
            Self::Invalid(_) => 422,
            Self::NotSupported(_) => 501,
            Self::NotFound { .. } | Self::UnknownKind(_) => 404,
            Self::Unauthorized(_) => 401,
            Self::Precondition(_) => 412,
            Self::Conflict { .. } => 412,
            Self::TooCostly(_) => 403,
            Self::UnsupportedFormat(_) => 415,
            Self::Internal(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }

    pub fn is_server_error(&self) -> bool {
        self.http_status() >= 500
    }
}

/// Abstract error kinds, mirrored in operation-outcome issue codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Structure,
    Invalid,
    NotSupported,
    NotFound,
    Unauthorized,
    BusinessRule,
    TooCostly,
    Exception,
}

impl ErrorKind {
    /// The issue `code` value used in operation outcomes.
    pub fn issue_code(&self) -> &'static str {
        match self {
            Self::Structure => "structure",
            Self::Invalid => "invalid",
            Self::NotSupported => "not-supported",
            Self::NotFound => "not-found",
            Self::Unauthorized => "forbidden",
            Self::BusinessRule => "business-rule",
            Self::TooCostly => "too-costly",
            Self::Exception => "exception",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.issue_code())
    }
}

/// Convenience result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
