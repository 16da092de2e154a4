//! Where profiling-trace data comes from.

use std::fmt;
use std::path::{Path, PathBuf};

use stallscope_types::trace::TraceData;

#[derive(Debug)]
pub enum TraceLoadError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, message: String },
}

impl fmt::Display for TraceLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "reading {}: {source}", path.display()),
            Self::Parse { path, message } => write!(f, "parsing {}: {message}", path.display()),
        }
    }
}

impl std::error::Error for TraceLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { .. } => None,
        }
    }
}

/// A lazily loaded trace. The context calls [`load`](Self::load) at most once.
pub trait TraceSource: Send + Sync {
    fn describe(&self) -> String;
    fn load(&self) -> Result<TraceData, TraceLoadError>;
}

/// Trace data that is already decoded.
pub struct InMemoryTrace(pub TraceData);

impl TraceSource for InMemoryTrace {
    fn describe(&self) -> String {
        self.0
            .source
            .clone()
            .unwrap_or_else(|| "in-memory trace".to_string())
    }

    fn load(&self) -> Result<TraceData, TraceLoadError> {
        Ok(self.0.clone())
    }
}

/// A trace already converted to the JSON event model.
pub struct JsonTraceFile {
    path: PathBuf,
}

impl JsonTraceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSource for JsonTraceFile {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<TraceData, TraceLoadError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| TraceLoadError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut data: TraceData =
            facet_json::from_str(&text).map_err(|e| TraceLoadError::Parse {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        if data.source.is_none() {
            data.source = Some(self.describe());
        }
        Ok(data)
    }
}
