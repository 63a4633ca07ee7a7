//! Colorized console format for local development.
//!
//! Format: `HH:MM:SS.mmm LEVEL target: message [span{fields}]`

use nu_ansi_term::{Color, Style};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

pub struct PrettyLogFormat;

fn level_style(level: &Level) -> Style {
    if *level == Level::ERROR {
        Style::new().fg(Color::Red)
    } else if *level == Level::WARN {
        Style::new().fg(Color::Yellow)
    } else if *level == Level::INFO {
        Style::new().fg(Color::Green)
    } else if *level == Level::DEBUG {
        Style::new().fg(Color::Blue)
    } else {
        Style::new().fg(Color::Purple)
    }
}

impl<S, N> FormatEvent<S, N> for PrettyLogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let dimmed = Style::new().dimmed();

        write!(
            writer,
            "{} ",
            dimmed.paint(chrono::offset::Local::now().format("%T%.3f").to_string())
        )?;

        let level = level_style(metadata.level());
        write!(writer, "{} ", level.paint(format!("{:<5}", metadata.level())))?;
        write!(writer, "{} ", dimmed.paint(format!("{}:", metadata.target())))?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope {
                write!(writer, " {}", dimmed.paint(format!("[{}", span.name())))?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>()
                    && !fields.is_empty()
                {
                    write!(writer, "{}", dimmed.paint(format!("{{{}}}", fields)))?;
                }

                write!(writer, "{}", dimmed.paint("]"))?;
            }
        }

        writeln!(writer)
    }
}
