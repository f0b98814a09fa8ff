//! provides logging helpers

use std::fmt::{self};
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Events with this target carry one serialized sample each and go to the
/// stats file instead of the log.
pub const STATS_TARGET: &str = "stats";

/// Writes the bare event message, one line per event.
struct RawLineFormatter;

struct MessageVisitor {
    msg: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.msg.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.msg.push_str(&format!("{value:?}"));
        }
    }
}

impl<S, N> FormatEvent<S, N> for RawLineFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor { msg: String::new() };
        event.record(&mut visitor);
        writeln!(writer, "{}", visitor.msg)
    }
}

/// initiate the global tracing subscriber
///
/// Samples logged with [`STATS_TARGET`] are appended to `stats_file` (rotated
/// daily, three files kept) when given and dropped otherwise. The returned
/// guard flushes the file writer on drop.
pub fn init(stats_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let fmt_layer = utils::logging::get_fmt_layer().with_filter(
        utils::logging::env_filter().and(filter::filter_fn(|metadata| {
            metadata.target() != STATS_TARGET
        })),
    );

    let (stats_layer, guard) = match stats_file {
        Some(stats_file) => {
            let dir = stats_file
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let prefix = stats_file
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("invalid stats file {}", stats_file.display()))?;

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(3)
                .build(dir)
                .context("failed to create rolling stats file appender")?;
            let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

            let stats_layer = layer()
                .event_format(RawLineFormatter)
                .fmt_fields(format::DefaultFields::new())
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(filter::filter_fn(|metadata| {
                    metadata.target() == STATS_TARGET
                }));
            (Some(stats_layer), Some(file_guard))
        }
        None => (None, None),
    };

    registry().with(fmt_layer).with(stats_layer).init();
    Ok(guard)
}
