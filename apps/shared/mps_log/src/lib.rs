//! Centralized logging for the scripting client
//!
//! Provides a custom formatter for tracing that:
//! - Formats thread IDs as #N instead of ThreadId(N)
//! - Extracts `peer`, `event` and `proc` fields to display as `peer::name`
//! - Strips common prefixes from targets for cleaner output
//! - Filters external dependency logs based on `MPS_LOGDEPS` environment variable
//!
//! # Environment Variables
//!
//! - `MPS_LOGDEPS`: Set to `1` to enable logging from external dependencies (tokio, etc.).
//!   Default is `0` which only shows logs from the `mps_*` crates.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mps_log::{init_logging, LogConfig};
//! use tracing::Level;
//!
//! let config = LogConfig::new("mps_client::");
//! init_logging(config)?;
//!
//! // Or with file logging
//! let file = std::fs::File::create("client.log")?;
//! let config = LogConfig::new("mps_client::")
//!     .with_log_file(file)
//!     .with_level(Level::DEBUG);
//! init_logging(config)?;
//! ```

use std::fmt as std_fmt;
use std::io::Write;
use tracing::Level;
use tracing::field::Field;
use tracing_subscriber::field::Visit;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields, format::Writer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Crates whose logs pass the default filter
const OWN_CRATES: &[&str] = &["mps_client", "mps_core", "mps_protocol", "mps_log"];

/// Field extractor for the bridge's structured fields
///
/// Events and procedures are logged with an `event` or `proc` field, and
/// optionally the `peer` address they came from; the formatter prints them as
/// `peer::name: message` instead of the module target.
#[derive(Default)]
pub struct FieldExtractor {
    pub peer: Option<String>,
    pub event: Option<String>,
    pub proc_name: Option<String>,
    pub message: Option<String>,
}

impl FieldExtractor {
    fn slot(&mut self, field: &Field) -> Option<&mut Option<String>> {
        match field.name() {
            "peer" => Some(&mut self.peer),
            "event" => Some(&mut self.event),
            "proc" => Some(&mut self.proc_name),
            "message" => Some(&mut self.message),
            _ => None,
        }
    }

    /// `peer::name` label, when an event or procedure field was recorded
    pub fn scope_label(&self) -> Option<String> {
        let name = self.proc_name.as_ref().or(self.event.as_ref())?;
        Some(match &self.peer {
            Some(peer) => format!("{}::{}", peer, name),
            None => name.clone(),
        })
    }
}

impl Visit for FieldExtractor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if let Some(slot) = self.slot(field) {
            *slot = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std_fmt::Debug) {
        if let Some(slot) = self.slot(field) {
            *slot = Some(format!("{:?}", value).trim_matches('"').to_string());
        }
    }
}

/// Custom event formatter
///
/// Features:
/// - Thread IDs displayed as #N instead of ThreadId(N)
/// - Bridge logs formatted as `peer::proc: message`
/// - Configurable ANSI color support
/// - Configurable target prefix stripping
pub struct CustomFormatter<T> {
    timer: T,
    ansi: bool,
    /// Prefix to strip from log targets (e.g., "mps_client::")
    strip_prefix: Option<String>,
}

impl<T> CustomFormatter<T> {
    pub fn new(timer: T, ansi: bool) -> Self {
        Self {
            timer,
            ansi,
            strip_prefix: None,
        }
    }

    /// Set the prefix to strip from log targets
    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    fn display_target<'a>(&self, target: &'a str) -> Option<&'a str> {
        let display = match &self.strip_prefix {
            Some(prefix) if target.starts_with(prefix.trim_end_matches("::")) => {
                target.strip_prefix(prefix.as_str()).unwrap_or(target)
            }
            _ => target,
        };

        // Hide the bare app name when it appears alone
        let app_name = self.strip_prefix.as_ref().map(|p| p.trim_end_matches("::"));
        if display.is_empty() || app_name.is_some_and(|name| display == name) {
            None
        } else {
            Some(display)
        }
    }
}

impl<T: Clone> Clone for CustomFormatter<T> {
    fn clone(&self) -> Self {
        Self {
            timer: self.timer.clone(),
            ansi: self.ansi,
            strip_prefix: self.strip_prefix.clone(),
        }
    }
}

impl<S, N, T> FormatEvent<S, N> for CustomFormatter<T>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    T: fmt::time::FormatTime,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std_fmt::Result {
        let metadata = event.metadata();

        let (dim_start, dim_end) = if self.ansi {
            ("\x1b[2m", "\x1b[0m")
        } else {
            ("", "")
        };
        let (level_color, level_str) = match *metadata.level() {
            Level::ERROR => (if self.ansi { "\x1b[31m" } else { "" }, "ERROR"),
            Level::WARN => (if self.ansi { "\x1b[33m" } else { "" }, " WARN"),
            Level::INFO => (if self.ansi { "\x1b[32m" } else { "" }, " INFO"),
            Level::DEBUG => (if self.ansi { "\x1b[34m" } else { "" }, "DEBUG"),
            Level::TRACE => (if self.ansi { "\x1b[35m" } else { "" }, "TRACE"),
        };
        let color_end = if self.ansi { "\x1b[0m" } else { "" };

        write!(writer, "{}", dim_start)?;
        self.timer.format_time(&mut writer)?;
        write!(writer, "{} ", dim_end)?;

        write!(writer, "{}{}{} ", level_color, level_str, color_end)?;

        let thread_id = format!("{:?}", std::thread::current().id());
        if let Some(num_str) = thread_id
            .strip_prefix("ThreadId(")
            .and_then(|s| s.strip_suffix(")"))
        {
            if let Ok(num) = num_str.parse::<u64>() {
                write!(writer, "#{:03} ", num)?;
            }
        }

        let mut extractor = FieldExtractor::default();
        event.record(&mut extractor);

        if let Some(label) = extractor.scope_label() {
            write!(writer, "{}{}{}: ", dim_start, label, dim_end)?;
            if let Some(msg) = &extractor.message {
                write!(writer, "{}", msg)?;
            }
        } else {
            if let Some(target) = self.display_target(metadata.target()) {
                write!(writer, "{}{}{}: ", dim_start, target, dim_end)?;
            }
            ctx.field_format().format_fields(writer.by_ref(), event)?;
        }

        writeln!(writer)
    }
}

/// Create a timer with custom format
///
/// Uses format: `[year]/[month]/[day] [hour]:[minute]:[second].[subsecond digits:4]`
pub fn create_custom_timer()
-> OffsetTime<&'static [time::format_description::BorrowedFormatItem<'static>]> {
    use time::macros::format_description;

    let format =
        format_description!("[year]/[month]/[day] [hour]:[minute]:[second].[subsecond digits:4]");
    let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    OffsetTime::new(offset, format)
}

/// Check if dependency logging is enabled via MPS_LOGDEPS environment variable
pub fn is_dependency_logging_enabled() -> bool {
    std::env::var("MPS_LOGDEPS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Build the filter directive for dependency logging
///
/// Without `log_deps` everything outside the `mps_*` crates is turned off.
pub fn build_filter_directives(level: Level, log_deps: bool) -> String {
    let level_str = match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    };

    if log_deps {
        return level_str.to_string();
    }

    let mut directives = String::from("off");
    for krate in OWN_CRATES {
        directives.push_str(&format!(",{}={}", krate, level_str));
    }
    directives
}

/// Detect if ANSI colors should be used based on environment
///
/// Disables ANSI colors if:
/// - stdout is not a TTY (piped/redirected)
/// - NO_COLOR env var is set (https://no-color.org/)
/// - TERM=dumb
pub fn should_use_ansi() -> bool {
    atty::is(atty::Stream::Stdout)
        && std::env::var("NO_COLOR").is_err()
        && std::env::var("TERM").map(|t| t != "dumb").unwrap_or(true)
}

/// Logging configuration
pub struct LogConfig<W: Write + Send + 'static = std::fs::File> {
    /// Prefix to strip from log targets (e.g., "mps_client::")
    pub strip_prefix: String,
    /// Whether to use ANSI color codes (auto-detected if None)
    pub use_ansi: Option<bool>,
    /// Minimum log level
    pub level: Level,
    /// Optional file to write logs to
    pub log_file: Option<W>,
}

impl<W: Write + Send + 'static> LogConfig<W> {
    pub fn new(strip_prefix: impl Into<String>) -> Self {
        Self {
            strip_prefix: strip_prefix.into(),
            use_ansi: None,
            level: Level::DEBUG,
            log_file: None,
        }
    }

    pub fn with_ansi(mut self, use_ansi: bool) -> Self {
        self.use_ansi = Some(use_ansi);
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_log_file(mut self, file: W) -> Self {
        self.log_file = Some(file);
        self
    }
}

/// Initialize logging with the given configuration
///
/// # Environment Variables
///
/// * `MPS_LOGDEPS` - Set to `1` to enable logging from external dependencies.
/// * `RUST_LOG` - Can override the default filter directives
pub fn init_logging<W: Write + Send + 'static>(
    config: LogConfig<W>,
) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::EnvFilter;

    let timer = create_custom_timer();
    let use_ansi = config.use_ansi.unwrap_or_else(should_use_ansi);
    let filter_directives = build_filter_directives(config.level, is_dependency_logging_enabled());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&filter_directives));

    let formatter_stdout =
        CustomFormatter::new(timer.clone(), use_ansi).with_strip_prefix(&config.strip_prefix);
    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(formatter_stdout)
        .with_ansi(use_ansi)
        .with_writer(std::io::stdout);

    match config.log_file {
        Some(file) => {
            let formatter_file =
                CustomFormatter::new(timer, false).with_strip_prefix(&config.strip_prefix);
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .event_format(formatter_file)
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .with(env_filter)
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(env_filter)
                .try_init()?;
        }
    }

    Ok(())
}

/// Initialize logging without a log file
pub fn init_logging_simple(
    strip_prefix: impl Into<String>,
    level: Level,
) -> Result<(), Box<dyn std::error::Error>> {
    let config: LogConfig<std::fs::File> = LogConfig::new(strip_prefix).with_level(level);
    init_logging(config)
}
