use thiserror::Error;

/// Crate wide result alias
pub type Result<T> = std::result::Result<T, SpatialError>;

/// Errors raised by the spatial association engine
///
/// Insufficient cell counts are not represented here; they yield a missing
/// value (`None`) that propagates through aggregation and regression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpatialError {
    /// Malformed cell records within one image
    #[error("input data error in image '{image_id}': {reason}")]
    InputData { image_id: String, reason: String },
    /// A contextual query whose parent set does not hold the `to` type, or a
    /// cell type that is neither mapped nor unassigned
    #[error("invalid hierarchy for '{query}': {reason}")]
    InvalidHierarchy { query: String, reason: String },
    /// A regression or Cox fit that could not be estimated for one column
    #[error("model for column '{column}' is not estimable: {reason}")]
    ModelNonEstimable { column: String, reason: String },
    /// Invalid global configuration or malformed table; aborts the run
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("CSV error: {0}")]
    Csv(String),
}

impl From<std::io::Error> for SpatialError {
    fn from(err: std::io::Error) -> Self {
        SpatialError::Io(err.to_string())
    }
}

impl From<csv::Error> for SpatialError {
    fn from(err: csv::Error) -> Self {
        SpatialError::Csv(err.to_string())
    }
}

impl SpatialError {
    /// Short name of the error kind, used in batch failure reports
    pub fn kind(&self) -> &'static str {
        match self {
            SpatialError::InputData { .. } => "InputDataError",
            SpatialError::InvalidHierarchy { .. } => "InvalidHierarchy",
            SpatialError::ModelNonEstimable { .. } => "ModelNonEstimable",
            SpatialError::InvalidConfig(_) => "InvalidConfig",
            SpatialError::Io(_) => "Io",
            SpatialError::Csv(_) => "Csv",
        }
    }

    pub(crate) fn input(image_id: &str, reason: impl Into<String>) -> Self {
        SpatialError::InputData {
            image_id: image_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn hierarchy(query: &str, reason: impl Into<String>) -> Self {
        SpatialError::InvalidHierarchy {
            query: query.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn non_estimable(column: &str, reason: impl Into<String>) -> Self {
        SpatialError::ModelNonEstimable {
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}
