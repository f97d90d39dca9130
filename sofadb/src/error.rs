use thiserror::Error;

#[derive(Error, Debug)]
pub enum SofaError {
    #[error("database not found")]
    DbNotFound,

    #[error("database already exists")]
    DbExists,

    #[error("invalid database name: {0}")]
    DbInvalidName(String),

    #[error("document not found")]
    DocNotFound,

    #[error("document update conflict")]
    DocConflict,

    #[error("invalid document id: {0}")]
    DocInvalidId(String),

    #[error("document id does not match the request path")]
    MismatchId,

    #[error("invalid JSON: {0}")]
    BadJson(String),

    #[error("invalid design document: {0}")]
    InvalidDesignDocument(String),

    #[error("view not found")]
    ViewNotFound,

    #[error("view select not found")]
    ViewSelectNotFound,

    #[error("document version is required")]
    VersionMissing,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SofaError {
    /// Stable wire code used in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SofaError::DbNotFound => "db_not_found",
            SofaError::DbExists => "db_exists",
            SofaError::DbInvalidName(_) => "db_invalid_name",
            SofaError::DocNotFound => "doc_not_found",
            SofaError::DocConflict => "doc_conflict",
            SofaError::DocInvalidId(_) => "doc_invalid_id",
            SofaError::MismatchId => "mismatch_id",
            SofaError::BadJson(_) => "bad_json",
            SofaError::InvalidDesignDocument(_) => "invalid_design_document",
            SofaError::ViewNotFound => "view_not_found",
            SofaError::ViewSelectNotFound => "view_select_not_found",
            SofaError::VersionMissing => "version_missing",
            SofaError::Sqlite(_) | SofaError::Io(_) | SofaError::Json(_) => "internal_error",
        }
    }

    /// The `{"error": ..., "reason": ...}` response shape shared by every surface.
    pub fn to_response(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.code(), "reason": self.to_string() })
    }
}

pub type Result<T> = std::result::Result<T, SofaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        assert_eq!(SofaError::DocConflict.code(), "doc_conflict");
        assert_eq!(SofaError::DbNotFound.code(), "db_not_found");
        assert_eq!(
            SofaError::DocInvalidId("_bad".into()).code(),
            "doc_invalid_id"
        );
    }

    #[test]
    fn test_storage_faults_map_to_internal_error() {
        let e = SofaError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(e.code(), "internal_error");
    }

    #[test]
    fn test_response_shape() {
        let body = SofaError::DocConflict.to_response();
        assert_eq!(body["error"], "doc_conflict");
        assert!(body["reason"].is_string());
    }
}
