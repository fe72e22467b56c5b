use crate::aws::ApiError;
use crate::config::ConfigurationError;
use crate::parameters::ParameterWriteError;
use crate::trust::TrustSetupError;

/// A topology request that cannot be turned into a pipeline at all.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Repository {0} must not be empty")]
    EmptyRepositoryField(&'static str),
}

/// A built graph that breaks its own structural rules.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("Stage ordering violated: {0}")]
    StageOrder(String),

    #[error("Export `{0}` is defined more than once")]
    DuplicateExport(String),

    #[error("Export `{name}` already exists with value `{existing}` (from {exporting_stack}); refusing to redefine it as `{requested}`")]
    ExportConflict {
        name: String,
        existing: String,
        requested: String,
        exporting_stack: String,
    },

    #[error("Unable to list existing exports: {0}")]
    ExportLookup(#[source] ApiError),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    TrustSetup(#[from] TrustSetupError),

    #[error(transparent)]
    ParameterWrite(#[from] ParameterWriteError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Unable to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
