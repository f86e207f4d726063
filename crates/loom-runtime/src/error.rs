use std::path::PathBuf;

use crate::filter::{FilterParseError, FilterType};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("filter {0} already exists")]
    DuplicateFilterId(u32),
    #[error("filter {0} does not exist")]
    UnknownFilterId(u32),
    #[error("malformed filter: {0}")]
    MalformedFilter(String),
    #[error("filter type {0} is not supported")]
    UnsupportedFilterType(FilterType),
    #[error("cannot read filter file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("format error in filter file: {0}")]
    Parse(#[from] FilterParseError),
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to start the loom daemon: {0}")]
    DaemonStart(#[source] std::io::Error),
    #[error("process already started")]
    AlreadyStarted,
}
