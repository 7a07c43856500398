// Copyright 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![deny(missing_docs)]
#![deny(warnings)]

//! Centralized file logging for the virtual EPC subsystem.

use chrono::offset::{Local, Utc};
use chrono::DateTime;
use flexi_logger::writers::LogWriter;
use flexi_logger::{DeferredNow, Record};
use nix::unistd::Uid;
use std::env;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{Error, ErrorKind, Result, Write};
use std::ops::DerefMut;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::common::{EpcErrorEnum, EpcResult};
use crate::new_epc_failure;

/// The default logging level used by the logger.
const DEFAULT_LOG_LEVEL: &str = "info";

/// The environment variable which holds the path to the logging directory.
const LOGS_DIR_PATH_ENV_VAR: &str = "VIRT_EPC_LOGS_PATH";

/// The default path to the logging directory.
const LOGS_DIR_PATH: &str = "/var/log/virt_epc";

/// The name of the output log file.
const LOG_FILE_NAME: &str = "virt_epc.log";

/// A log writer which directs all records of the EPC subsystem to a single
/// centralized file, reopening it if it disappears underneath us.
#[derive(Clone)]
pub struct EpcLogWriter {
    out_file: Arc<Mutex<File>>,
}

impl EpcLogWriter {
    /// Create a new log writer.
    pub fn new() -> EpcResult<Self> {
        Ok(EpcLogWriter {
            out_file: Arc::new(Mutex::new(
                open_log_file(&get_log_file_path())
                    .map_err(|e| e.add_subaction("Failed to open log file".to_string()))?,
            )),
        })
    }

    /// Check if the log file is present and if it is not, (re)open it.
    fn safe_open_log_file(&self) -> EpcResult<()> {
        let log_path = &get_log_file_path();
        if !log_path.exists() {
            let new_file = open_log_file(log_path)
                .map_err(|e| e.add_subaction(String::from("Failed to open log file")))?;
            let mut file_ref = self.out_file.lock().map_err(|e| {
                new_epc_failure!(
                    &format!("Failed to acquire lock: {:?}", e),
                    EpcErrorEnum::LockAcquireFailure
                )
            })?;
            *file_ref.deref_mut() = new_file;
        }

        Ok(())
    }

    /// Generate a single message string.
    fn create_msg(&self, now: &DateTime<Local>, record: &Record) -> String {
        // UTC timestamp according to RFC 3339.
        let timestamp = DateTime::<Utc>::from_naive_utc_and_offset(now.naive_utc(), Utc)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        format!(
            "[{}][{}][{}:{}] {}\n",
            record.level(),
            timestamp,
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            &record.args()
        )
    }
}

impl LogWriter for EpcLogWriter {
    fn write(&self, now: &mut DeferredNow, record: &Record) -> Result<()> {
        if self.safe_open_log_file().is_err() {
            return Err(Error::new(
                ErrorKind::Other,
                "Failed to safely open log file for writing",
            ));
        }

        let record_str = self.create_msg(now.now(), record);
        if let Ok(mut out_file) = self.out_file.lock() {
            out_file.deref_mut().write_all(record_str.as_bytes())?;

            return Ok(());
        }

        Err(Error::new(ErrorKind::Other, "Failed to lock log file"))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn max_log_level(&self) -> log::LevelFilter {
        // The log level is either given in RUST_LOG or defaults to a specified value.
        let level = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

        match level.to_lowercase().as_ref() {
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}

/// Get the directory containing EPC-related log files.
pub fn get_log_file_base_path() -> String {
    match env::var(LOGS_DIR_PATH_ENV_VAR) {
        Ok(env_path) => env_path,
        Err(_) => LOGS_DIR_PATH.to_string(),
    }
}

/// Get the path to the log file.
fn get_log_file_path() -> PathBuf {
    Path::new(&get_log_file_base_path()).join(LOG_FILE_NAME)
}

/// Open a file at a given location for writing and appending.
fn open_log_file(file_path: &Path) -> EpcResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .read(false)
        .open(file_path)
        .map_err(|e| {
            new_epc_failure!(
                &format!("Failed to open log file: {:?}", e),
                EpcErrorEnum::FileOperationFailure
            )
            .add_info(vec![
                file_path
                    .to_str()
                    .unwrap_or("Invalid unicode log file name"),
                "Open",
            ])
        })?;

    let log_file_uid = Uid::from_raw(
        file.metadata()
            .map_err(|e| {
                new_epc_failure!(
                    &format!("Failed to get log file metadata: {:?}", e),
                    EpcErrorEnum::FileOperationFailure
                )
                .add_info(vec![
                    file_path
                        .to_str()
                        .unwrap_or("Invalid unicode log file name"),
                    "Get metadata",
                ])
            })?
            .uid(),
    );

    // The log file should be write-accessible to any user, since any
    // process embedding the subsystem may log to it. Only the file's
    // owner may change its permissions.
    if log_file_uid == Uid::current() {
        let perms = Permissions::from_mode(0o766);
        file.set_permissions(perms).map_err(|e| {
            new_epc_failure!(
                &format!("Failed to change log file permissions: {:?}", e),
                EpcErrorEnum::FilePermissionsError
            )
        })?;
    }

    Ok(file)
}

/// Initialize logging.
pub fn init_logger() -> EpcResult<EpcLogWriter> {
    let log_writer = EpcLogWriter::new()?;

    // Initialize logging with the new log writer.
    flexi_logger::Logger::try_with_env_or_str(DEFAULT_LOG_LEVEL)
        .map_err(|e| {
            new_epc_failure!(
                &format!("Failed to initialize logger: {:?}", e),
                EpcErrorEnum::LoggerError
            )
        })?
        .log_to_writer(Box::new(log_writer.clone()))
        .start()
        .map_err(|e| {
            new_epc_failure!(
                &format!("Failed to initialize logger: {:?}", e),
                EpcErrorEnum::LoggerError
            )
        })?;

    Ok(log_writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::NamedTempFile;

    /// Tests that `open_log_file()` creates a file with the expected
    /// permissions.
    #[test]
    fn test_open_log_file() {
        let file0 = NamedTempFile::new();

        if let Ok(file0) = file0 {
            let test_file_path = file0.path();

            let f = open_log_file(test_file_path).unwrap();
            let metadata = f.metadata();
            assert!(metadata.is_ok());

            if let Ok(metadata) = metadata {
                assert!(metadata.is_file());
                let permissions = metadata.permissions();
                let mode = permissions.mode();

                assert_eq!(mode & 0o777, 0o766);
            }
        }
    }

    /// Tests that the log writer creates the centralized log file inside the
    /// directory given by the environment variable.
    #[test]
    fn test_log_writer_creates_file() {
        let tmp_log_dir: &str = "./.tmp_logs_epc_writer";

        // Get old environment variable value.
        let old_log_path = env::var(LOGS_DIR_PATH_ENV_VAR);
        let path_existed = Path::new(tmp_log_dir).exists();

        env::set_var(LOGS_DIR_PATH_ENV_VAR, tmp_log_dir);
        let _ = fs::create_dir(tmp_log_dir);

        let log_writer = EpcLogWriter::new();
        assert!(log_writer.is_ok());
        assert!(Path::new(tmp_log_dir).join(LOG_FILE_NAME).exists());

        if !path_existed {
            let _ = fs::remove_dir_all(tmp_log_dir);
        } else {
            let _ = fs::remove_file(format!("{}/{}", tmp_log_dir, &LOG_FILE_NAME));
        }

        // Reset old environment variable value if necessary.
        if let Ok(old_log_path) = old_log_path {
            env::set_var(LOGS_DIR_PATH_ENV_VAR, old_log_path);
        } else {
            env::remove_var(LOGS_DIR_PATH_ENV_VAR);
        }
    }
}
