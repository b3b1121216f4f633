//! Tracing setup for the agent.
//!
//! All agent logs go out with a `GUARD_AGENT` prefix so they are easy to
//! separate from host-application logs sharing the same stream:
//!
//! ```text
//! GUARD_AGENT | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! Hosts that already install their own subscriber can skip
//! [`init_logging`] entirely; the agent's events then flow into the host's
//! pipeline unprefixed.

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Log formatter that prefixes every event with `GUARD_AGENT`.
///
/// Active spans are included with their fields, giving hierarchical context
/// for nested operations.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "GUARD_AGENT | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs a global `tracing` subscriber using [`Formatter`], filtered to
/// `level` (overridable via `RUST_LOG`). Safe to call more than once; only
/// the first call wins.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("guard_agent={level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(Formatter)
        .try_init();
}
