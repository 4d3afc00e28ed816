use std::path::Path;

const CLI_ERROR_CODE_JSON: &str = "json";

#[derive(Debug)]
pub(crate) enum CliError {
    Tool(safefs::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Tool(err) => write!(f, "{err}"),
            CliError::Json(err) => write!(f, "json error: {err}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Tool(err) => Some(err),
            CliError::Json(err) => Some(err),
        }
    }
}

impl From<safefs::Error> for CliError {
    fn from(err: safefs::Error) -> Self {
        Self::Tool(err)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl CliError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            CliError::Tool(err) => err.code(),
            CliError::Json(_) => CLI_ERROR_CODE_JSON,
        }
    }
}

fn details_map(kind: &'static str) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    out.insert(
        "kind".to_string(),
        serde_json::Value::String(kind.to_string()),
    );
    out
}

fn path_value(path: &Path) -> serde_json::Value {
    serde_json::Value::String(path.display().to_string())
}

fn insert_io(
    out: &mut serde_json::Map<String, serde_json::Value>,
    op: &str,
    path: &Path,
    source: &std::io::Error,
) {
    out.insert("op".to_string(), serde_json::Value::String(op.to_string()));
    out.insert("path".to_string(), path_value(path));
    out.insert(
        "io_kind".to_string(),
        serde_json::Value::String(format!("{:?}", source.kind())),
    );
    if let Some(raw_os_error) = source.raw_os_error() {
        out.insert("raw_os_error".to_string(), serde_json::json!(raw_os_error));
    }
}

/// Structured details for `--error-format json`.
pub(crate) fn tool_error_details(tool: &safefs::Error) -> serde_json::Value {
    let mut out = details_map(tool.code());
    match tool {
        safefs::Error::Io(err) => {
            out.insert(
                "io_kind".to_string(),
                serde_json::Value::String(format!("{:?}", err.kind())),
            );
        }
        safefs::Error::IoPath { op, path, source }
        | safefs::Error::BackupIo { op, path, source }
        | safefs::Error::WriteIo { op, path, source } => insert_io(&mut out, op, path, source),
        safefs::Error::PathDenied { path, reason } => {
            out.insert("path".to_string(), path_value(path));
            out.insert("reason".to_string(), serde_json::json!(reason));
            out.insert(
                "explanation".to_string(),
                serde_json::Value::String(reason.explain().to_string()),
            );
        }
        safefs::Error::PrivilegeDenied(denial) => {
            out.insert("reason".to_string(), serde_json::json!(denial));
        }
        safefs::Error::PatchConflict(conflict) => {
            out.insert("conflict".to_string(), serde_json::json!(conflict));
        }
        safefs::Error::ScopeViolation(violation) => {
            out.insert("violation".to_string(), serde_json::json!(violation));
        }
        safefs::Error::BackupNotFound(path) | safefs::Error::InvalidUtf8(path) => {
            out.insert("path".to_string(), path_value(path));
        }
        safefs::Error::TooLarge {
            path,
            size_bytes,
            max_bytes,
        } => {
            out.insert("path".to_string(), path_value(path));
            out.insert("size_bytes".to_string(), serde_json::json!(size_bytes));
            out.insert("max_bytes".to_string(), serde_json::json!(max_bytes));
        }
        _ => {}
    }
    serde_json::Value::Object(out)
}

pub(crate) fn render_json(err: &CliError) -> String {
    let mut error = serde_json::Map::new();
    error.insert(
        "code".to_string(),
        serde_json::Value::String(err.code().to_string()),
    );
    error.insert(
        "message".to_string(),
        serde_json::Value::String(err.to_string()),
    );
    if let CliError::Tool(tool) = err {
        error.insert("details".to_string(), tool_error_details(tool));
    }
    let out = serde_json::json!({ "error": error });
    serde_json::to_string(&out).unwrap_or_else(|_| err.to_string())
}
