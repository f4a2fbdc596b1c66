// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::fmt;
use std::process::ExitCode;

/// CLI-specific error type with exit code mapping
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments
    InvalidArgs(String),
    /// Pipeline construction or streaming failure
    Pipeline(String),
    /// Operation timed out
    Timeout(String),
    /// General error from the HAL library
    General(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::Pipeline(msg) => write!(f, "Pipeline error: {}", msg),
            CliError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CliError::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::InvalidArgs(_) => ExitCode::from(2),
            CliError::Pipeline(_) => ExitCode::from(3),
            CliError::Timeout(_) => ExitCode::from(6),
            CliError::General(_) => ExitCode::from(1),
        }
    }
}

/// Map camhal::Error to CliError with appropriate exit codes
impl From<camhal::Error> for CliError {
    fn from(err: camhal::Error) -> Self {
        use camhal::Error;

        match err {
            Error::BadValue(msg) => CliError::InvalidArgs(msg),
            Error::InvalidOperation(msg) => CliError::Pipeline(msg),
            Error::Timeout => CliError::Timeout("operation timed out".to_string()),
            Error::NoBuffer => CliError::Pipeline("buffer pool exhausted".to_string()),
            Error::Io(io_err) => CliError::General(format!("I/O error: {}", io_err)),
        }
    }
}

/// Helper function to convert result to exit code
pub fn result_to_exit_code<T>(result: Result<T, CliError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            CliError::InvalidArgs("test".into()).exit_code(),
            ExitCode::from(2)
        );
        assert_eq!(
            CliError::Pipeline("test".into()).exit_code(),
            ExitCode::from(3)
        );
        assert_eq!(
            CliError::Timeout("test".into()).exit_code(),
            ExitCode::from(6)
        );
        assert_eq!(
            CliError::General("test".into()).exit_code(),
            ExitCode::from(1)
        );
    }

    #[test]
    fn test_error_display() {
        let err = CliError::Pipeline("isp start failed".to_string());
        assert_eq!(format!("{}", err), "Pipeline error: isp start failed");
    }

    #[test]
    fn test_error_mapping() {
        let err: CliError = camhal::Error::NoBuffer.into();
        assert!(matches!(err, CliError::Pipeline(_)));
        let err: CliError = camhal::Error::Timeout.into();
        assert!(matches!(err, CliError::Timeout(_)));
    }
}
