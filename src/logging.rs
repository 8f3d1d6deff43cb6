use colored::*;
use std::fmt;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::error::{MqError, MqResult};

/// Console event format for client diagnostics.
///
/// A connection interleaves output from several threads (the read
/// channel, session dispatch threads, the application), so every line
/// leads with a colored severity tag and the emitting module:
///
/// ```text
/// WARN  openmq_client::connection  broker connection lost: socket read failed
/// ```
pub struct ClientLogFormatter;

impl<S, N> FormatEvent<S, N> for ClientLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let tag = match *metadata.level() {
            Level::ERROR => "ERROR".red().bold(),
            Level::WARN => "WARN ".yellow(),
            Level::INFO => "INFO ".green(),
            Level::DEBUG => "DEBUG".blue(),
            Level::TRACE => "TRACE".purple(),
        };
        write!(writer, "{} {}  ", tag, metadata.target().dimmed())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the console subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_console_logging() {
    let _ = tracing_subscriber::fmt()
        .event_format(ClientLogFormatter)
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Installs a file subscriber writing to `directory`, with the file name
/// produced from `pattern` (see [`expand_file_pattern`]) at generation 0.
///
/// The returned guard must stay alive for the duration of logging; dropping
/// it flushes and stops the background writer.
pub fn init_file_logging(directory: &Path, pattern: &str) -> MqResult<WorkerGuard> {
    let file_name = expand_file_pattern(pattern, 0)?;
    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
    Ok(guard)
}

/// Expands a log-file name pattern for one rotation generation.
///
/// `%g` substitutes the generation number and may appear at most once;
/// `%%g` escapes to a literal `%g`. A pattern with no `%g` gets the
/// generation appended after a dot, so rotated files stay distinct.
pub fn expand_file_pattern(pattern: &str, generation: u32) -> MqResult<String> {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut substituted = false;
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                if chars.peek() == Some(&'g') {
                    chars.next();
                    out.push_str("%g");
                } else {
                    out.push('%');
                }
            }
            Some('g') => {
                chars.next();
                if substituted {
                    return Err(MqError::UnsupportedArgumentValue);
                }
                out.push_str(&generation.to_string());
                substituted = true;
            }
            _ => out.push('%'),
        }
    }

    if !substituted {
        out.push('.');
        out.push_str(&generation.to_string());
    }
    Ok(out)
}
