// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for development tools and the test suite.  These should
//! not be used in production code.

pub mod poll;

use camino::Utf8PathBuf;
use conductor_config::ConfigLogging;
use conductor_config::ConfigLoggingIfExists;
use conductor_config::ConfigLoggingLevel;
use slog::Logger;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

static LOG_CONTEXT_ID: AtomicU32 = AtomicU32::new(0);

/// A logger for one test, writing to its own file
///
/// The file is left behind if the test fails so that it can be inspected.  A
/// test that passes calls [`LogContext::cleanup_successful()`] to remove it.
pub struct LogContext {
    pub log: Logger,
    log_path: Option<Utf8PathBuf>,
}

impl LogContext {
    /// Sets up a logger for the test named `test_name`
    ///
    /// For file-based configurations, the configured path is replaced with a
    /// unique file in the temporary directory named after the test.
    pub fn new(test_name: &str, initial_config: &ConfigLogging) -> LogContext {
        let (log_config, log_path) = match initial_config {
            ConfigLogging::File { level, if_exists, .. } => {
                let path = log_file_for_test(test_name);
                eprintln!("log file: {}", path);
                let config = ConfigLogging::File {
                    level: *level,
                    path: path.clone(),
                    if_exists: *if_exists,
                };
                (config, Some(path))
            }
            other => (other.clone(), None),
        };

        let log = log_config
            .to_logger("conductor-test")
            .unwrap_or_else(|error| panic!("failed to create logger: {error}"));
        LogContext { log, log_path }
    }

    /// Removes the log file, if any
    pub fn cleanup_successful(self) {
        if let Some(path) = &self.log_path {
            std::fs::remove_file(path).unwrap_or_else(|error| {
                panic!("failed to remove log file {path}: {error}")
            });
        }
    }
}

fn log_file_for_test(test_name: &str) -> Utf8PathBuf {
    let id = LOG_CONTEXT_ID.fetch_add(1, Ordering::SeqCst);
    let mut path = Utf8PathBuf::try_from(std::env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
    path.push(format!("{}.{}.{}.log", test_name, std::process::id(), id));
    path
}

/// Set up a [`LogContext`] appropriate for a test named `test_name`
pub fn test_setup_log(test_name: &str) -> LogContext {
    let log_config = ConfigLogging::File {
        level: ConfigLoggingLevel::Trace,
        path: Utf8PathBuf::from("UNUSED"),
        if_exists: ConfigLoggingIfExists::Fail,
    };

    LogContext::new(test_name, &log_config)
}
