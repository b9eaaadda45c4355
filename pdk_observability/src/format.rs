//! Compact single-line log format.
//!
//! `[LEVEL] [MM-DD|HH:MM:SS.mmm] message key=value key=value`
use std::{fmt, io};

use nu_ansi_term::Color;
use time::{OffsetDateTime, format_description::OwnedFormatItem};
use tracing::{Event, Level, Subscriber, field, span};
use tracing_subscriber::{
    field::{RecordFields, VisitFmt, VisitOutput},
    fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format::Writer},
    registry::LookupSpan,
};

const MESSAGE_WIDTH: usize = 40;

pub struct PdkFormat {
    time_format: Option<OwnedFormatItem>,
}

impl<S, N> FormatEvent<S, N> for PdkFormat
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
        let ansi = writer.has_ansi_escapes();
        write_level(&mut writer, event.metadata().level(), ansi)?;
        writer.write_char(' ')?;
        if self.write_time(&mut writer).is_err() {
            writer.write_str("[<unknown-timestamp>]")?;
        }
        writer.write_char(' ')?;

        ctx.format_fields(writer.by_ref(), event)?;

        // Fields of the enclosing spans, innermost last.
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, " {fields}")?;
                    }
                }
            }
        }

        writeln!(writer)
    }
}

impl<'w> FormatFields<'w> for PdkFormat {
    fn format_fields<R: RecordFields>(&self, writer: Writer<'w>, fields: R) -> fmt::Result {
        let mut visitor = FieldVisitor::new(writer, true);
        fields.record(&mut visitor);
        visitor.finish()
    }

    fn add_fields(
        &self,
        current: &'w mut FormattedFields<Self>,
        fields: &span::Record<'_>,
    ) -> fmt::Result {
        let is_empty = current.is_empty();
        let mut visitor = FieldVisitor::new(current.as_writer(), is_empty);
        fields.record(&mut visitor);
        visitor.finish()
    }
}

impl PdkFormat {
    fn write_time(&self, writer: &mut Writer<'_>) -> fmt::Result {
        let Some(format) = &self.time_format else {
            return Err(fmt::Error);
        };

        let now = OffsetDateTime::now_utc();
        let mut adaptor = WriteAdaptor { writer };
        now.format_into(&mut adaptor, format)
            .map(|_| ())
            .map_err(|_| fmt::Error)
    }
}

impl Default for PdkFormat {
    fn default() -> Self {
        let time_format = time::format_description::parse_owned::<2>(
            r#"\[[month]-[day]|[hour]:[minute]:[second].[subsecond digits:3]\]"#,
        )
        .ok();

        Self { time_format }
    }
}

fn write_level(writer: &mut Writer<'_>, level: &Level, ansi: bool) -> fmt::Result {
    let (label, color) = match *level {
        Level::TRACE => ("TRACE", Color::Purple),
        Level::DEBUG => ("DEBUG", Color::Blue),
        Level::INFO => ("INFO", Color::Green),
        Level::WARN => ("WARN", Color::Yellow),
        Level::ERROR => ("ERROR", Color::Red),
    };

    if ansi {
        write!(writer, "[{}]", color.paint(label))
    } else {
        write!(writer, "[{label}]")
    }
}

struct FieldVisitor<'a> {
    writer: Writer<'a>,
    is_empty: bool,
    result: fmt::Result,
}

impl<'a> FieldVisitor<'a> {
    fn new(writer: Writer<'a>, is_empty: bool) -> Self {
        Self {
            writer,
            is_empty,
            result: Ok(()),
        }
    }

    fn separator(&mut self) -> &'static str {
        if std::mem::take(&mut self.is_empty) {
            ""
        } else {
            " "
        }
    }
}

impl field::Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        if field.name() == "message" {
            self.record_debug(field, &format_args!("{value}"));
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_error(&mut self, field: &field::Field, value: &(dyn std::error::Error + 'static)) {
        self.record_debug(field, &format_args!("{value}"));
    }

    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        if self.result.is_err() {
            return;
        }

        let separator = self.separator();
        let ansi = self.writer.has_ansi_escapes();
        self.result = match field.name() {
            "message" => write!(
                self.writer,
                "{separator}{:<width$}",
                format!("{value:?}"),
                width = MESSAGE_WIDTH
            ),
            name if ansi => {
                let color = if name == "error" { Color::Red } else { Color::Blue };
                write!(
                    self.writer,
                    "{separator}{name}={}",
                    color.paint(format!("{value:?}"))
                )
            }
            name => write!(self.writer, "{separator}{name}={value:?}"),
        };
    }
}

impl VisitOutput<fmt::Result> for FieldVisitor<'_> {
    fn finish(self) -> fmt::Result {
        self.result
    }
}

impl VisitFmt for FieldVisitor<'_> {
    fn writer(&mut self) -> &mut dyn fmt::Write {
        &mut self.writer
    }
}

/// Lets `time` write into a `fmt::Write`.
struct WriteAdaptor<'a, 'w> {
    writer: &'a mut Writer<'w>,
}

impl io::Write for WriteAdaptor<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = std::str::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_str(s).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
