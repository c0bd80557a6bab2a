// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    env,
    io::IsTerminal,
    sync::{
        LazyLock, Once, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use snafu::{ResultExt, Snafu};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Registry, filter, layer::SubscriberExt, prelude::*};

/// Deserializes a string value, using `Default::default()` if the string is
/// empty.
///
/// # Errors
/// Returns an error if deserialization fails.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

/// The default directory name for log files when file logging is enabled.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Handle for changing the log filter at runtime. Set by
/// [`init_global_logging`].
pub static RELOAD_HANDLE: OnceLock<tracing_subscriber::reload::Handle<filter::Targets, Registry>> =
    OnceLock::new();

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TelemetryError {
    #[snafu(display("Failed to install the log tracer"))]
    LogTracer {
        source: tracing_log::log::SetLoggerError,
    },

    #[snafu(display("Failed to create rolling log file in {dir}"))]
    Appender {
        dir:    String,
        source: tracing_appender::rolling::InitError,
    },

    #[snafu(display("Invalid log level filter {level:?}"))]
    Level {
        level:  String,
        source: filter::ParseError,
    },

    #[snafu(display("Failed to set the global tracing subscriber"))]
    SetGlobal {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

/// Configuration options for the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for log files, rotated hourly. Empty means stdout only.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Filter such as `"info"` or `"info,chronoq_queue=debug"`. Falls back to
    /// `RUST_LOG`, then `info`.
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log, 720 by default (30 days of hourly files).
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    /// Also write to stdout when logging to files.
    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

/// Available log output formats.
#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, for log pipelines.
    Json,

    /// Human-readable lines.
    #[default]
    Text,
}

/// Stdout-only text logging with default options.
///
/// # Errors
///
/// See [`init_global_logging`].
pub fn init_tracing_subscriber(app_name: &str) -> Result<Vec<WorkerGuard>, TelemetryError> {
    init_global_logging(app_name, &LoggingOptions::default())
}

/// Initialize logging for unit tests. Safe to call from every test; only the
/// first call installs the subscriber.
///
/// `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) and
/// `UNITTEST_LOG_LEVEL` (default `debug`) configure it.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());

        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            ..Default::default()
        };
        match init_global_logging("unittest", &opts) {
            Ok(guards) => {
                *GLOBAL_UT_LOG_GUARD.lock() = Some(guards);
                tracing::info!("logs dir = {}", dir);
            }
            Err(error) => eprintln!("unit test logging disabled: {error}"),
        }
    });
}

/// Keeps the unit test worker guards alive for the whole test run.
static GLOBAL_UT_LOG_GUARD: LazyLock<Mutex<Option<Vec<WorkerGuard>>>> =
    LazyLock::new(|| Mutex::new(None));

const DEFAULT_LOG_TARGETS: &str = "info";

static INITIALISED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber: stdout (if `append_stdout`), hourly files
/// named after `app_name` in `dir`, and a separate error-only file.
///
/// Only the first call does anything; later calls return no guards. Keep the
/// returned guards alive for as long as logs should be written.
///
/// # Errors
///
/// Fails when the log directory cannot be used, the level filter does not
/// parse, or another global subscriber or logger is already installed.
pub fn init_global_logging(
    app_name: &str,
    opts: &LoggingOptions,
) -> Result<Vec<WorkerGuard>, TelemetryError> {
    if INITIALISED.swap(true, Ordering::AcqRel) {
        return Ok(Vec::new());
    }
    let mut guards = vec![];

    LogTracer::init().context(LogTracerSnafu)?;

    let stdout_logging_layer = if opts.append_stdout {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);

        if opts.log_format == LogFormat::Json {
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .json()
                    .with_writer(writer)
                    .with_ansi(std::io::stdout().is_terminal())
                    .with_current_span(true)
                    .with_span_list(true)
                    .boxed(),
            )
        } else {
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(writer)
                    .with_ansi(std::io::stdout().is_terminal())
                    .boxed(),
            )
        }
    } else {
        None
    };

    let file_logging_layer = if opts.dir.is_empty() {
        None
    } else {
        let (writer, guard) = rolling_writer(opts, app_name)?;
        guards.push(guard);

        if opts.log_format == LogFormat::Json {
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_current_span(true)
                    .with_span_list(true)
                    .boxed(),
            )
        } else {
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed(),
            )
        }
    };

    let err_file_logging_layer = if opts.dir.is_empty() {
        None
    } else {
        let (writer, guard) = rolling_writer(opts, &format!("{app_name}-err"))?;
        guards.push(guard);

        if opts.log_format == LogFormat::Json {
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter::LevelFilter::ERROR)
                    .boxed(),
            )
        } else {
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter::LevelFilter::ERROR)
                    .boxed(),
            )
        }
    };

    let level = opts
        .level
        .clone()
        .or_else(|| env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_TARGETS.to_string());
    let filter = level
        .parse::<filter::Targets>()
        .context(LevelSnafu { level: &level })?;

    let (dyn_filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    let _ = RELOAD_HANDLE.set(reload_handle);

    let subscriber = Registry::default()
        .with(dyn_filter)
        .with(stdout_logging_layer)
        .with(file_logging_layer)
        .with(err_file_logging_layer);

    tracing::subscriber::set_global_default(subscriber).context(SetGlobalSnafu)?;

    Ok(guards)
}

fn rolling_writer(
    opts: &LoggingOptions,
    prefix: &str,
) -> Result<(NonBlocking, WorkerGuard), TelemetryError> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .context(AppenderSnafu { dir: &opts.dir })?;
    Ok(tracing_appender::non_blocking(appender))
}
