//! Output formatting: plain text or one JSON document per line.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::{Value, json};

use cogs_core::MessageRecord;

use crate::cli::OutputFormat;
use crate::error::CliError;

/// Render a channel list.
pub fn render_channels(format: OutputFormat, channels: &[String]) -> Result<String, CliError> {
    match format {
        OutputFormat::Plain => Ok(channels.join("\n")),
        OutputFormat::Json => render_json(&json!({ "channels": channels })),
    }
}

/// Render one push message.
pub fn render_record(format: OutputFormat, record: &MessageRecord) -> Result<String, CliError> {
    match format {
        OutputFormat::Plain => Ok(format!(
            "{} [{}] {}",
            record.timestamp.to_rfc3339(),
            record.channel,
            record.message
        )),
        OutputFormat::Json => render_json(record),
    }
}

/// Render a single named value, e.g. a session UUID or message id.
pub fn render_value(
    format: OutputFormat,
    name: &str,
    value: &impl Serialize,
) -> Result<String, CliError> {
    match format {
        OutputFormat::Plain => Ok(match serde_json::to_value(value)? {
            Value::String(s) => s,
            other => other.to_string(),
        }),
        OutputFormat::Json => render_json(&json!({ name: value })),
    }
}

fn render_json(data: &impl Serialize) -> Result<String, CliError> {
    Ok(serde_json::to_string(data)?)
}

/// Write rendered output followed by a newline, skipping empty output.
pub fn print_output(rendered: &str) {
    if rendered.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{rendered}");
}
