// Copyright 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![deny(missing_docs)]
#![deny(warnings)]

//! Shared error-handling infrastructure for the virtual EPC subsystem.

pub mod logger;

use lazy_static::lazy_static;
use log::error;
use std::collections::HashMap;
use std::env;

/// The result type used throughout the crate.
pub type EpcResult<T> = Result<T, EpcFailure>;

/// Constant used for identifying the backtrace environment variable.
const BACKTRACE_VAR: &str = "BACKTRACE";

/// All possible errors which may occur.
#[derive(Debug, Clone, Copy, Hash, PartialEq)]
pub enum EpcErrorEnum {
    /// Unspecified error (invariant violations only; avoid elsewhere).
    UnspecifiedError = 0,
    /// A zero-size EPC allocation was requested.
    SizeError,
    /// No kernel vEPC support (control device missing or unopenable).
    ResourceUnavailable,
    /// The kernel rejected the vEPC creation request.
    CreationFailed,
    /// A required backend reference is missing or unresolvable.
    ConfigError,
    /// The referenced backend is already mapped by another section.
    ConflictError,
    /// Section creation was attempted after vCPUs already exist.
    OrderingError,
    /// Cumulative section placement wraps the guest address space.
    AddressSpaceOverflow,
    /// A section lookup was issued for an unregistered index.
    SectionNotFound,
    /// Memory mapping failure.
    MmapError,
    /// Memory unmapping failure.
    MunmapError,
    /// File operation failure.
    FileOperationFailure,
    /// File permissions error.
    FilePermissionsError,
    /// Failed to acquire a lock.
    LockAcquireFailure,
    /// Logger-related error.
    LoggerError,
}

impl Default for EpcErrorEnum {
    fn default() -> EpcErrorEnum {
        EpcErrorEnum::UnspecifiedError
    }
}

impl Eq for EpcErrorEnum {}

/// Struct that is passed along the backtrace and accumulates error messages.
#[derive(Debug, Default)]
pub struct EpcFailure {
    /// Main action which was attempted and failed.
    pub action: String,
    /// (Possibly) more subactions which lead to the root cause of the failure.
    pub subactions: Vec<String>,
    /// Computer-readable error code.
    pub error_code: EpcErrorEnum,
    /// File in which the root error occurred.
    pub file: String,
    /// Line at which the root error occurred.
    pub line: u32,
    /// Additional info regarding the error, passed as individual components.
    pub additional_info: Vec<String>,
}

impl EpcFailure {
    /// Returns an empty `EpcFailure` object.
    pub fn new() -> Self {
        EpcFailure {
            action: String::new(),
            subactions: vec![],
            error_code: EpcErrorEnum::default(),
            file: String::new(),
            line: 0,
            additional_info: vec![],
        }
    }

    /// Sets the main action which failed (i.e. REALIZE_SECTION).
    pub fn set_action(mut self, action: String) -> Self {
        self.action = action;
        self
    }

    /// Adds a new layer into the backtrace, corresponding to a failing subaction.
    pub fn add_subaction(mut self, subaction: String) -> Self {
        self.subactions.push(subaction);
        self
    }

    /// Sets the error code.
    pub fn set_error_code(mut self, error_code: EpcErrorEnum) -> Self {
        self.error_code = error_code;
        self
    }

    /// Sets the name of the file the error occurred in.
    pub fn set_file(mut self, file: &str) -> Self {
        self.file = file.to_string();
        self
    }

    /// Sets the number of the line the error occurred on.
    pub fn set_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// Sets both error file and error line.
    pub fn set_file_and_line(mut self, file: &str, line: u32) -> Self {
        self.file = file.to_string();
        self.line = line;
        self
    }

    /// Include additional error information.
    pub fn add_info(mut self, info: Vec<&str>) -> Self {
        for info_ in info {
            self.additional_info.push(info_.to_string());
        }
        self
    }

    /// Render a user-facing error message, with the accumulated backtrace
    /// appended whenever the backtrace environment variable is enabled.
    pub fn construct_error_message(&self) -> String {
        let (code, description) = *EPC_ERROR_CODES
            .get(&self.error_code)
            .unwrap_or(&("E00", "Unspecified error"));

        let mut ret = format!("[{}] {}", code, description);
        for info in &self.additional_info {
            ret.push_str(&format!(": {}", info));
        }

        if env::var(BACKTRACE_VAR) == Ok("1".to_string()) {
            ret.push_str(&format!("\n{}", self.backtrace()));
        }

        ret
    }

    /// Render the accumulated backtrace.
    pub fn backtrace(&self) -> String {
        let mut ret = format!("  Action: {}\n  Subactions:", self.action);
        for subaction in self.subactions.iter().rev() {
            ret.push_str(&format!("\n    {}", subaction));
        }
        ret.push_str(&format!(
            "\n  Root error file: {}\n  Root error line: {}",
            self.file, self.line
        ));

        ret
    }
}

/// Macro used for constructing an EpcFailure in a more convenient manner.
#[macro_export]
macro_rules! new_epc_failure {
    ($subaction:expr, $error_code:expr) => {
        $crate::common::EpcFailure::new()
            .add_subaction(($subaction).to_string())
            .set_error_code($error_code)
            .set_file_and_line(file!(), line!())
    };
}

lazy_static! {
    /// Structure mapping error enum values to a stable error code and a
    /// default user-facing description.
    pub static ref EPC_ERROR_CODES: HashMap<EpcErrorEnum, (&'static str, &'static str)> =
        [
            (EpcErrorEnum::UnspecifiedError, ("E00", "Unspecified error")),
            (EpcErrorEnum::SizeError, ("E01", "Zero-size EPC backend requested")),
            (EpcErrorEnum::ResourceUnavailable, ("E02", "SGX virtual EPC is not supported on this system")),
            (EpcErrorEnum::CreationFailed, ("E03", "Failed to create SGX virtual EPC instance")),
            (EpcErrorEnum::ConfigError, ("E04", "Backend reference missing or invalid")),
            (EpcErrorEnum::ConflictError, ("E05", "Memory backend is already in use")),
            (EpcErrorEnum::OrderingError, ("E06", "EPC section created after vCPUs")),
            (EpcErrorEnum::AddressSpaceOverflow, ("E07", "EPC placement wraps the guest address space")),
            (EpcErrorEnum::SectionNotFound, ("E08", "No EPC section registered at this index")),
            (EpcErrorEnum::MmapError, ("E09", "Failed to map memory")),
            (EpcErrorEnum::MunmapError, ("E10", "Failed to unmap memory")),
            (EpcErrorEnum::FileOperationFailure, ("E11", "File operation failure")),
            (EpcErrorEnum::FilePermissionsError, ("E12", "File permissions error")),
            (EpcErrorEnum::LockAcquireFailure, ("E13", "Failed to acquire lock")),
            (EpcErrorEnum::LoggerError, ("E14", "Logger error")),
        ].iter().cloned().collect();
}

/// Trait for aborting the process on errors which must be fatal to startup.
pub trait ExitGracefully<T, E> {
    /// Provide the value of the result or exit the process with a message.
    fn ok_or_exit(self, message: &str) -> T;
}

impl<T> ExitGracefully<T, EpcFailure> for EpcResult<T> {
    fn ok_or_exit(self, message: &str) -> T {
        match self {
            Ok(val) => val,
            Err(err) => {
                notify_error(&format!("{}: {}", message, err.construct_error_message()));
                std::process::exit(1);
            }
        }
    }
}

/// Notify both the user and the logger of an error.
pub fn notify_error(err_msg: &str) {
    eprintln!("{}", err_msg);
    error!("{}", err_msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that the assigned error codes are unique across the table.
    #[test]
    fn test_error_codes_unique() {
        let mut seen = std::collections::HashSet::new();
        for (code, _) in EPC_ERROR_CODES.values() {
            assert!(seen.insert(*code), "duplicate error code {}", code);
        }
    }

    /// Tests that the failure builder records subactions, error code and
    /// location.
    #[test]
    fn test_failure_builder() {
        let failure = new_epc_failure!("Could not open device", EpcErrorEnum::ResourceUnavailable)
            .set_action("ALLOC_BACKEND".to_string())
            .add_info(vec!["/dev/sgx_vepc"]);

        assert_eq!(failure.error_code, EpcErrorEnum::ResourceUnavailable);
        assert_eq!(failure.action, "ALLOC_BACKEND");
        assert_eq!(failure.subactions.len(), 1);
        assert!(failure.line > 0);
        assert!(failure.file.ends_with("mod.rs"));
    }

    /// Tests that the user-facing message carries the stable error code and
    /// the additional info.
    #[test]
    fn test_construct_error_message() {
        let failure = new_epc_failure!("busy", EpcErrorEnum::ConflictError).add_info(vec!["epc0"]);
        let msg = failure.construct_error_message();

        assert!(msg.starts_with("[E05]"));
        assert!(msg.contains("epc0"));
    }

    /// Tests that the rendered backtrace lists the outermost subaction first.
    #[test]
    fn test_backtrace_order() {
        let failure = new_epc_failure!("inner", EpcErrorEnum::UnspecifiedError)
            .add_subaction("outer".to_string());
        let backtrace = failure.backtrace();

        let outer_pos = backtrace.find("outer").unwrap();
        let inner_pos = backtrace.find("inner").unwrap();
        assert!(outer_pos < inner_pos);
    }
}
