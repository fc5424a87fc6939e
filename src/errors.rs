//! Error types for the scoring driver stages.
//!
//! Errors are stage-specific to keep diagnostics precise: driver/scheduler
//! failures, formatter failures, and audit parsing failures are separate
//! types. Enums are `#[non_exhaustive]` so variants can be added without
//! breaking callers; consumers should include a fallback match arm.
//!
//! Deadline expiry is deliberately NOT represented here — running out of
//! budget truncates the score sequence and is a normal outcome, not a
//! failure.

use std::fmt;
use std::io;

/// Errors from driver operations (`predict`, `train`, `explain_line`,
/// `close`).
///
/// `EngineGone` is terminal: it poisons the handle and every subsequent
/// operation fails fast with the same kind.
#[derive(Debug)]
#[non_exhaustive]
pub enum DriverError {
    /// The engine child died, a pipe broke, or the engine emitted output
    /// outside its wire grammar. The driver is permanently unusable.
    EngineGone { detail: String },
    /// The formatter failed while producing the shared line prefix.
    ///
    /// Per-item formatter failures do not take this path; they follow the
    /// skip-and-count policy and are visible in `PredictMetrics`.
    Format(FormatError),
    /// The handle was opened in audit mode; scoring and training are
    /// unavailable.
    AuditModeActive,
    /// `explain_line` requires a handle opened in audit mode.
    AuditModeInactive,
    /// `predict` on a write-only handle.
    WriteOnly,
    /// The engine's audit output did not match the audit grammar.
    Audit(AuditParseError),
    /// Invalid arguments or driver state (mismatched lengths, mixed modes,
    /// operations on a closed driver).
    BadInput { detail: String },
    /// I/O error not attributable to engine death.
    Io(io::Error),
}

impl DriverError {
    /// Creates an `EngineGone` with human-readable context.
    #[inline]
    pub fn engine_gone(detail: impl Into<String>) -> Self {
        Self::EngineGone {
            detail: detail.into(),
        }
    }

    /// Creates a `BadInput` with human-readable context.
    #[inline]
    pub fn bad_input(detail: impl Into<String>) -> Self {
        Self::BadInput {
            detail: detail.into(),
        }
    }

    /// Maps an I/O error observed on an engine pipe to its driver meaning.
    ///
    /// Broken pipes and unexpected EOF mean the child is gone; everything
    /// else stays an I/O error.
    pub fn from_pipe_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Self::EngineGone {
                detail: format!("engine pipe closed: {err}"),
            },
            _ => Self::Io(err),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EngineGone { detail } => write!(f, "scoring engine gone: {detail}"),
            Self::Format(err) => write!(f, "formatter failed for common prefix: {err}"),
            Self::AuditModeActive => {
                write!(f, "handle is in audit mode; only explain_line is available")
            }
            Self::AuditModeInactive => write!(f, "explain_line requires audit mode"),
            Self::WriteOnly => write!(f, "cannot predict on a write-only handle"),
            Self::Audit(err) => write!(f, "{err}"),
            Self::BadInput { detail } => write!(f, "bad input: {detail}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Format(err) => Some(err),
            Self::Audit(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<FormatError> for DriverError {
    fn from(err: FormatError) -> Self {
        Self::Format(err)
    }
}

impl From<AuditParseError> for DriverError {
    fn from(err: AuditParseError) -> Self {
        Self::Audit(err)
    }
}

/// A caller-supplied formatter failed to produce a line fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    detail: String,
}

impl FormatError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "format error: {}", self.detail)
    }
}

impl std::error::Error for FormatError {}

/// An audit-mode output line did not match the audit grammar.
///
/// `column` is the byte offset into `line` where parsing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditParseError {
    /// The offending line, verbatim.
    pub line: String,
    /// Byte offset of the failure within `line`.
    pub column: usize,
    /// What was expected at that position.
    pub detail: &'static str,
}

impl fmt::Display for AuditParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "audit parse error at column {}: {} (line: {:?})",
            self.column, self.detail, self.line
        )
    }
}

impl std::error::Error for AuditParseError {}
