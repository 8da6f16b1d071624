// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::fmt;
use std::process::ExitCode;

/// CLI-specific error type with exit code mapping
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments
    InvalidArgs(String),
    /// Stream size or layout the sensor cannot serve
    UnsupportedStream(String),
    /// Request table or raw buffer ring exhausted
    QueueFull(String),
    /// A hardware device call failed
    Hardware(String),
    /// Operation timed out
    Timeout(String),
    /// General error from the camhal library
    General(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::UnsupportedStream(msg) => write!(f, "Unsupported stream: {}", msg),
            CliError::QueueFull(msg) => write!(f, "Queue full: {}", msg),
            CliError::Hardware(msg) => write!(f, "Hardware error: {}", msg),
            CliError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CliError::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    fn code(&self) -> u8 {
        match self {
            CliError::General(_) => 1,
            CliError::InvalidArgs(_) => 2,
            CliError::UnsupportedStream(_) => 3,
            CliError::QueueFull(_) => 4,
            CliError::Hardware(_) => 5,
            CliError::Timeout(_) => 6,
        }
    }
}

/// Map camhal::Error to CliError with appropriate exit codes
impl From<camhal::Error> for CliError {
    fn from(err: camhal::Error) -> Self {
        use camhal::Error;

        match err {
            Error::UnsupportedStream(msg) => CliError::UnsupportedStream(msg),
            Error::InvalidStream(msg) => CliError::InvalidArgs(msg),
            Error::QueueFull | Error::SlotBusy(_) | Error::Full => {
                CliError::QueueFull(err.to_string())
            }
            Error::Device { ref source, .. } if source.kind() == std::io::ErrorKind::TimedOut => {
                CliError::Timeout(err.to_string())
            }
            Error::Device { .. } => CliError::Hardware(err.to_string()),
            Error::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::TimedOut => CliError::Timeout(io_err.to_string()),
                _ => CliError::General(format!("I/O error: {}", io_err)),
            },
            _ => CliError::General(err.to_string()),
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
