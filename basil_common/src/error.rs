//! Error handling utilities for the Basil compiler

use thiserror::Error;

/// The main error type for the Basil back end.
///
/// Internal invariant violations carry the compiler source location they
/// were raised from; user visible failures carry whatever context is
/// available at the failure site.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BasilError {
    #[error("out of memory")]
    Oom,

    #[error("code index {0:#x} is not word aligned")]
    BadAlignment(usize),

    #[error("internal compiler error at {file}:{line}")]
    AssertionFailed { file: &'static str, line: u32 },

    #[error("jump of {0} bytes exceeds the branch range")]
    JumpTooFar(i64),

    #[error("failed to open {path}: {message}")]
    FileOpen { path: String, message: String },

    #[error("write failed: {0}")]
    FileWrite(String),

    #[error("close failed: {0}")]
    FileClose(String),

    #[error("division by zero in a constant expression")]
    DivideByZero,
}

/// Result type alias for Basil compiler operations
pub type BasilResult<T> = Result<T, BasilError>;

/// Raises [`BasilError::AssertionFailed`] pointing at the call site.
///
/// Invariant violations are compiler bugs, not user errors; the location
/// recorded here is the compiler's own source, which is what ends up in
/// the diagnostic.
#[macro_export]
macro_rules! assertion_failed {
    () => {
        $crate::error::BasilError::AssertionFailed {
            file: file!(),
            line: line!(),
        }
    };
}

impl BasilError {
    pub fn file_open(path: impl Into<String>, message: impl ToString) -> Self {
        Self::FileOpen {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// True for the error kinds that indicate a bug in the compiler
    /// itself rather than a problem with the input or the environment.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::AssertionFailed { .. } | Self::BadAlignment(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assertion_failed_records_location() {
        let err = assertion_failed!();
        match err {
            BasilError::AssertionFailed { file, line } => {
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            _ => panic!("wrong error kind"),
        }
    }

    #[test]
    fn test_internal_classification() {
        assert!(assertion_failed!().is_internal());
        assert!(BasilError::BadAlignment(3).is_internal());
        assert!(!BasilError::Oom.is_internal());
        assert!(!BasilError::DivideByZero.is_internal());
    }
}
