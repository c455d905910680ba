//! Enqueue payload parsing.

use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context};
use serde_json::Value;

/// A validated `enqueue` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    pub max_retries: u32,
}

/// Read the raw payload: `--file` wins, then the positional argument, then stdin.
pub fn read_raw(file: Option<&Path>, inline: Option<&str>) -> anyhow::Result<String> {
    if let Some(path) = file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()));
    }
    if let Some(raw) = inline {
        return Ok(raw.to_string());
    }
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read job JSON from stdin")?;
    Ok(raw)
}

/// Parse `{"id": ..., "command": ..., "max_retries": ...}`.
///
/// Numeric ids are accepted and stored as their decimal text.
pub fn parse(raw: &str, default_max_retries: u32) -> anyhow::Result<NewJob> {
    let value: Value = serde_json::from_str(raw).context("invalid JSON")?;
    let Value::Object(obj) = value else {
        bail!("job payload must be a JSON object");
    };

    let id = match obj.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => bail!("field `id` must be a string or number"),
        None => bail!("missing required field: id"),
    };
    if id.trim().is_empty() {
        bail!("field `id` must not be empty");
    }

    let command = match obj.get("command") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => bail!("field `command` must be a string"),
        None => bail!("missing required field: command"),
    };
    if command.trim().is_empty() {
        bail!("field `command` must not be empty");
    }

    let max_retries = match obj.get("max_retries") {
        None | Some(Value::Null) => default_max_retries,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n >= 1)
            .context("field `max_retries` must be a positive integer")?,
    };

    Ok(NewJob {
        id,
        command,
        max_retries,
    })
}
