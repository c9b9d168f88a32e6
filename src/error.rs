//! Error types for release-miner
//!
//! This module provides the error taxonomy for a mining run:
//! - Planning contradictions (fatal before any download starts)
//! - Transfer failures (a narrow transient class is retried, everything else is fatal)
//! - Extraction failures (unrecognized container formats fail fast)
//! - Job failures (fatal to the run, sibling work is cancelled)

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for release-miner operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for release-miner
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "transfer.max_concurrent_transfers")
        key: Option<String>,
    },

    /// Planning failed because prerequisites contradict each other
    #[error("planning error: {0}")]
    Plan(#[from] PlanError),

    /// Transfer-related error that is not a raw I/O or network failure
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Archive extraction error
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// A job body reported failure
    #[error("job '{job}' failed: {source}")]
    Job {
        /// Name of the job that failed
        job: String,
        /// The error reported by the job body
        source: Box<Error>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// External tool execution failed (7z, etc.)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The run's cancellation scope was triggered
    #[error("operation cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Planning errors
#[derive(Debug, Error)]
pub enum PlanError {
    /// Prerequisites exist but cannot all hold at once
    #[error("contradictory prerequisites for job '{job}': {reason}")]
    Contradiction {
        /// The job whose prerequisites triggered the contradiction
        job: String,
        /// What contradicts what
        reason: String,
    },
}

/// Transfer errors that are classified before reaching the network or filesystem layer
#[derive(Debug, Error)]
pub enum TransferError {
    /// The remote answered with a non-success status
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// The requested locator
        url: String,
        /// The HTTP status code returned
        status: u16,
    },

    /// The downloaded content does not match the expected digest
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The destination the content was meant for
        path: PathBuf,
        /// The expected SHA-256 (lowercase hex)
        expected: String,
        /// The SHA-256 of what was received (lowercase hex)
        actual: String,
    },
}

/// Archive extraction errors
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The container format is not one of the recognized formats
    #[error("unrecognized archive format: {archive}")]
    UnrecognizedFormat {
        /// The archive whose format could not be determined
        archive: PathBuf,
    },

    /// The first stage ran but the expected inner payload was not produced
    #[error("expected payload '{expected}' not found after unwrapping {archive}")]
    MissingPayload {
        /// The outer archive
        archive: PathBuf,
        /// The inner artifact name that was expected
        expected: String,
    },

    /// The archive tool reported failure
    #[error("extraction failed for {archive}: {reason}")]
    ExtractionFailed {
        /// The archive file that failed to extract
        archive: PathBuf,
        /// The reason extraction failed
        reason: String,
    },

    /// A path filter pattern could not be compiled
    #[error("invalid path pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending glob pattern
        pattern: String,
        /// Why it was rejected
        reason: String,
    },
}

impl Error {
    /// Wrap an error reported by a job body
    pub fn job(job: impl Into<String>, source: Error) -> Self {
        Error::Job {
            job: job.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error only records that the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Get the machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Plan(PlanError::Contradiction { .. }) => "planning_contradiction",
            Error::Transfer(e) => match e {
                TransferError::HttpStatus { .. } => "http_status",
                TransferError::ChecksumMismatch { .. } => "checksum_mismatch",
            },
            Error::Extraction(e) => match e {
                ExtractionError::UnrecognizedFormat { .. } => "extraction_format_unrecognized",
                ExtractionError::MissingPayload { .. } => "missing_payload",
                ExtractionError::ExtractionFailed { .. } => "extraction_failed",
                ExtractionError::InvalidPattern { .. } => "invalid_pattern",
            },
            Error::Job { .. } => "job_failure",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::ExternalTool(_) => "external_tool_error",
            Error::NotSupported(_) => "not_supported",
            Error::Cancelled => "cancelled",
            Error::Other(_) => "internal_error",
        }
    }
}
