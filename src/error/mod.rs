use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use ts_rs::TS;

/// The error shape that leaves the library: printed by the CLI and embedded
/// in JSON reports.
///
/// Each module keeps its own `thiserror` enum (`MigrationError`,
/// `ExportError`, `ImportError`, `StoreError`) and converts into this at the
/// boundary, prefixing the code with the module name, e.g.
/// `EXPORT/WORKSPACE_NOT_FOUND`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AppError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[ts(type = "Record<string, string>")]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Code for errors built from a bare message.
    pub const GENERIC_CODE: &'static str = "BUNDLE/ERROR";
    /// Code for foreign errors that carry no code of their own.
    pub const UNKNOWN_CODE: &'static str = "BUNDLE/UNKNOWN";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        for (key, value) in &self.context {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        Self::new(Self::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        Self::new(Self::GENERIC_CODE, message)
    }
}

/// Walks the anyhow chain from the outermost context inwards. An `AppError`
/// found in the chain is kept as-is together with its own causes.
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        let mut links = Vec::new();
        for link in error.chain() {
            if let Some(app) = link.downcast_ref::<AppError>() {
                links.push(app.clone());
                break;
            }
            links.push(AppError::new(Self::UNKNOWN_CODE, link.to_string()));
        }
        links
            .into_iter()
            .rev()
            .reduce(|inner, outer| outer.with_cause(inner))
            .unwrap_or_else(|| AppError::new(Self::UNKNOWN_CODE, "unknown error"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        let app = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        match error.raw_os_error() {
            Some(os) => app.with_context("os_code", os.to_string()),
            None => app,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        let code = match error.classify() {
            Category::Io => "JSON/IO",
            Category::Syntax => "JSON/SYNTAX",
            Category::Data => "JSON/DATA",
            Category::Eof => "JSON/EOF",
        };
        let app = AppError::new(code, error.to_string());
        if error.line() == 0 {
            return app;
        }
        app.with_context("line", error.line().to_string())
            .with_context("column", error.column().to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Io(io) => AppError::from(io).with_context("source", "sqlite"),
            sqlx::Error::PoolTimedOut => {
                AppError::new("DB/POOL_TIMEOUT", "timed out waiting for a database connection")
            }
            sqlx::Error::PoolClosed => AppError::new("DB/POOL_CLOSED", "database pool is closed"),
            sqlx::Error::Database(db) => {
                let code = db
                    .code()
                    .map_or_else(|| "DB/DATABASE".to_string(), |c| format!("DB/SQLITE_{c}"));
                let app = AppError::new(code, db.message());
                match db.constraint() {
                    Some(constraint) => app.with_context("constraint", constraint),
                    None => app,
                }
            }
            other => AppError::new("DB/ERROR", other.to_string()),
        }
    }
}
