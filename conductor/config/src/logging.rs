// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging configuration
//!
//! This is the "log" top-level object of the conductor's configuration file.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::fs::OpenOptions;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "mode")]
pub enum ConfigLogging {
    #[serde(rename = "stderr-terminal")]
    StderrTerminal { level: ConfigLoggingLevel },

    #[serde(rename = "file")]
    File {
        level: ConfigLoggingLevel,
        path: Utf8PathBuf,
        if_exists: ConfigLoggingIfExists,
    },

    // "test-suite" mode generates log files in a particular directory that are
    // named with the program name, the process id, and a per-process counter,
    // so that concurrently-running tests in one process do not collide.
    #[serde(rename = "test-suite")]
    TestSuite { level: ConfigLoggingLevel, directory: Utf8PathBuf },
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingIfExists {
    Fail,
    Truncate,
    Append,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<ConfigLoggingLevel> for Level {
    fn from(config_level: ConfigLoggingLevel) -> Level {
        match config_level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("open log file \"{path}\": {err}")]
pub struct LogFileError {
    path: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

/// Distinguishes the log files of the test-suite loggers created by one
/// process
static TEST_SUITE_LOGGER_ID: AtomicU32 = AtomicU32::new(0);

impl ConfigLoggingIfExists {
    fn open_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.write(true);
        match self {
            ConfigLoggingIfExists::Fail => options.create_new(true),
            ConfigLoggingIfExists::Append => options.create(true).append(true),
            ConfigLoggingIfExists::Truncate => {
                options.create(true).truncate(true)
            }
        };
        options
    }
}

impl ConfigLogging {
    /// Builds the root logger described by this configuration
    ///
    /// `name` is the program name recorded in file-based (bunyan) records and
    /// used to name test-suite log files.
    pub fn to_logger(
        &self,
        name: &'static str,
    ) -> Result<Logger, LogFileError> {
        let logger = match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().stderr().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                root_logger(*level, drain)
            }
            ConfigLogging::File { level, path, if_exists } => {
                let drain =
                    bunyan_file_drain(&if_exists.open_options(), path, name)?;
                root_logger(*level, drain)
            }
            ConfigLogging::TestSuite { level, directory } => {
                let id = TEST_SUITE_LOGGER_ID.fetch_add(1, Ordering::SeqCst);
                let path = directory.join(format!(
                    "{}.{}.{}.log",
                    name,
                    std::process::id(),
                    id
                ));
                let options = ConfigLoggingIfExists::Fail.open_options();
                root_logger(*level, bunyan_file_drain(&options, &path, name)?)
            }
        };
        Ok(logger)
    }
}

/// Wraps `drain` in a level filter and an async drain, which serializes
/// records from every thread without blocking the executor
fn root_logger<D>(level: ConfigLoggingLevel, drain: D) -> Logger
where
    D: Drain + Send + 'static,
    D::Err: std::fmt::Debug,
{
    let filtered = slog::LevelFilter(drain, Level::from(level)).fuse();
    let drain = slog_async::Async::new(filtered).build().fuse();
    Logger::root(drain, o!("pid" => std::process::id()))
}

fn bunyan_file_drain(
    options: &OpenOptions,
    path: &Utf8Path,
    name: &'static str,
) -> Result<impl Drain<Ok = (), Err = slog::Never> + Send + 'static, LogFileError>
{
    let open = || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        options.open(path)
    };
    let file =
        open().map_err(|err| LogFileError { path: path.to_owned(), err })?;

    // Say where the records are going, since nothing else will.
    eprintln!("note: configured to log to \"{}\"", path);
    Ok(slog_bunyan::with_name(name, file).build().fuse())
}
