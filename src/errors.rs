use std::io;

use thiserror::Error;

/// Pipeline stage an error belongs to.
///
/// Parsing errors are recovered at the upload boundary and shown to the user;
/// the other stages abort the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    /// Upload decoding and sheet parsing.
    Parsing,
    /// Role declaration, activity lookup, reference-flow checks.
    Classification,
    /// Impact-engine evaluation.
    Evaluation,
    /// Filesystem, export, and configuration failures.
    Io,
}

/// Error type for every stage of the flow-normalization and impact pipeline.
#[derive(Debug, Error)]
pub enum LcaError {
    #[error("unit '{unit}' used by {context} is not supported")]
    UnsupportedUnit { unit: String, context: String },
    #[error("the {sheet} sheet is missing {missing}")]
    MalformedSheet { sheet: String, missing: String },
    #[error("the {sheet} sheet does not contain any data rows")]
    EmptyInput { sheet: String },
    #[error("one of the outputs must be the reference flow")]
    MissingReferenceFlow,
    #[error("only one output can be the reference flow, found: {}", .names.join(", "))]
    MultipleReferenceFlows { names: Vec<String> },
    #[error("reference flow '{name}' has an unusable mass flow: {detail}")]
    InvalidReferenceFlow { name: String, detail: String },
    #[error("impact engine failed for flow '{flow}' ({category}): {reason}")]
    EngineFailure {
        flow: String,
        category: String,
        reason: String,
    },
    #[error("inventory lookup failed for flow '{flow}' (activity {activity}): {reason}")]
    LookupFailure {
        flow: String,
        activity: String,
        reason: String,
    },
    #[error("{operation} failed: {reason}")]
    ServiceUnavailable { operation: String, reason: String },
    #[error("stream '{flow}' has not been given a flow type")]
    Unclassified { flow: String },
    #[error("unable to read the uploaded file '{filename}': {reason}")]
    UnreadableUpload { filename: String, reason: String },
    #[error("unable to export the results: {0}")]
    Export(String),
    #[error("the run was cancelled while processing '{flow}'")]
    Cancelled { flow: String },
    #[error("the run exceeded its time limit while processing '{flow}'")]
    TimedOut { flow: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LcaError {
    /// Stage this error is reported from.
    pub fn stage(&self) -> ErrorStage {
        match self {
            LcaError::UnsupportedUnit { .. }
            | LcaError::MalformedSheet { .. }
            | LcaError::EmptyInput { .. }
            | LcaError::UnreadableUpload { .. } => ErrorStage::Parsing,
            LcaError::MissingReferenceFlow
            | LcaError::MultipleReferenceFlows { .. }
            | LcaError::InvalidReferenceFlow { .. }
            | LcaError::Unclassified { .. }
            | LcaError::LookupFailure { .. } => ErrorStage::Classification,
            LcaError::EngineFailure { .. }
            | LcaError::ServiceUnavailable { .. }
            | LcaError::Cancelled { .. }
            | LcaError::TimedOut { .. } => ErrorStage::Evaluation,
            LcaError::Export(_) | LcaError::Configuration(_) | LcaError::Io(_) => ErrorStage::Io,
        }
    }

    /// Name of the flow the error is about, when there is one.
    pub fn flow(&self) -> Option<&str> {
        match self {
            LcaError::InvalidReferenceFlow { name, .. } => Some(name),
            LcaError::EngineFailure { flow, .. }
            | LcaError::LookupFailure { flow, .. }
            | LcaError::Unclassified { flow }
            | LcaError::Cancelled { flow }
            | LcaError::TimedOut { flow } => Some(flow),
            _ => None,
        }
    }
}

pub type Result<T, E = LcaError> = std::result::Result<T, E>;
