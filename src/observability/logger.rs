//! Markdown transcript logger for step runs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

/// Logger for step runs.
///
/// Writes one markdown section per step event so a whole run can be read
/// back as a transcript: start, decisions, tool results, client calls,
/// answers and the terminal outcome.
#[derive(Debug)]
pub struct Logger {
    log_file: PathBuf,
    log_level: String,
    /// Serialises appends from concurrent steps
    write_lock: Mutex<()>,
}

impl Logger {
    /// Initialize logger.
    ///
    /// # Arguments
    /// * `log_file` - Path to log file. If None, creates a timestamped file in temp directory.
    /// * `log_level` - Logging level (defaults to "INFO").
    pub fn new(log_file: Option<&Path>, log_level: Option<&str>) -> Result<Self> {
        let log_file = match log_file {
            Some(p) => p.to_path_buf(),
            None => {
                let mut dir = std::env::temp_dir();
                dir.push("stepflow");
                std::fs::create_dir_all(&dir).with_context(|| {
                    format!("Failed to create log directory: {}", dir.display())
                })?;
                let filename = format!(
                    "steps_{}_{}.md",
                    Utc::now().timestamp_millis(),
                    std::process::id()
                );
                dir.join(filename)
            }
        };

        let log_level = log_level.unwrap_or("INFO").to_string();

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }

        let logger = Self {
            log_file,
            log_level,
            write_lock: Mutex::new(()),
        };

        if !logger.log_file.exists() {
            logger.initialize_log_file()?;
        }

        Ok(logger)
    }

    /// Build a logger from the `[logging]` configuration section.
    #[cfg(feature = "config")]
    pub fn from_config(config: &crate::config::LoggingConfig) -> Result<Self> {
        let path = (!config.log_file.trim().is_empty()).then(|| Path::new(&config.log_file));
        Self::new(path, Some(&config.log_level))
    }

    fn initialize_log_file(&self) -> Result<()> {
        let mut file = File::create(&self.log_file)
            .with_context(|| format!("Failed to create log file: {}", self.log_file.display()))?;

        let now: DateTime<Utc> = Utc::now();

        writeln!(file, "# Step Orchestration Log\n")?;
        writeln!(file, "Log started: {}\n", now.to_rfc3339())?;
        writeln!(file, "---\n")?;

        Ok(())
    }

    fn append_to_log(&self, content: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("log writer poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("Failed to open log file: {}", self.log_file.display()))?;

        write!(file, "{}", content).with_context(|| "Failed to write to log file")?;

        Ok(())
    }

    fn is_debug(&self) -> bool {
        self.log_level.eq_ignore_ascii_case("debug")
    }

    /// Log the start of a step.
    ///
    /// # Arguments
    /// * `step_id` - Step identifier.
    /// * `user_id` - Owning user.
    /// * `conversation_id` - Owning conversation.
    /// * `loop_count` - Loop the step starts at (non-zero on resume).
    pub fn log_step_started(
        &self,
        step_id: &str,
        user_id: &str,
        conversation_id: &str,
        loop_count: u32,
    ) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let content = format!(
            "## Step Started - {}\n\n**Step:** {}\n**User:** {}\n**Conversation:** {}\n**Loop:** {}\n\n",
            now.to_rfc3339(),
            step_id,
            user_id,
            conversation_id,
            loop_count
        );

        self.append_to_log(&content)?;
        info!(step_id, loop_count, "step started");
        Ok(())
    }

    /// Log a model decision.
    ///
    /// # Arguments
    /// * `step_id` - Step identifier.
    /// * `loop_count` - Current loop.
    /// * `tool_calls` - Serialized tool calls of the decision.
    pub fn log_decision(&self, step_id: &str, loop_count: u32, tool_calls: &Value) -> Result<()> {
        let count = tool_calls.as_array().map(Vec::len).unwrap_or(0);
        let now: DateTime<Utc> = Utc::now();
        let mut content = format!(
            "### Decision - {}\n\n**Step:** {}\n**Loop:** {}\n**Tool Calls:** {}\n\n",
            now.to_rfc3339(),
            step_id,
            loop_count,
            count
        );
        if self.is_debug() {
            content.push_str(&format!(
                "```json\n{}\n```\n\n",
                serde_json::to_string_pretty(tool_calls).unwrap_or_default()
            ));
        }

        self.append_to_log(&content)?;
        info!(step_id, loop_count, tool_calls = count, "decision");
        Ok(())
    }

    /// Log one batch of server tool results.
    pub fn log_tool_results(&self, step_id: &str, results: &Value) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let mut content = format!(
            "### Tool Results - {}\n\n**Step:** {}\n\n",
            now.to_rfc3339(),
            step_id
        );
        for result in results.as_array().into_iter().flatten() {
            content.push_str(&format!(
                "- `{}` ({}) **{}**{}\n",
                result.get("name").and_then(Value::as_str).unwrap_or("?"),
                result.get("callId").and_then(Value::as_str).unwrap_or("?"),
                result.get("status").and_then(Value::as_str).unwrap_or("?"),
                if result.get("reused").and_then(Value::as_bool).unwrap_or(false) {
                    " reused"
                } else {
                    ""
                }
            ));
        }
        content.push('\n');

        self.append_to_log(&content)?;
        info!(step_id, "tool results logged");
        Ok(())
    }

    /// Log client calls handed to the remote client.
    pub fn log_client_calls(&self, step_id: &str, calls: &Value) -> Result<()> {
        let names: Vec<&str> = calls
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|c| c.get("name").and_then(Value::as_str))
            .collect();
        let now: DateTime<Utc> = Utc::now();
        let content = format!(
            "### Client Calls - {}\n\n**Step:** {}\n**Calls:** {}\n\n",
            now.to_rfc3339(),
            step_id,
            names.join(", ")
        );

        self.append_to_log(&content)?;
        info!(step_id, calls = names.len(), "awaiting client");
        Ok(())
    }

    /// Log the assistant answer of a step.
    pub fn log_assistant(&self, step_id: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let now: DateTime<Utc> = Utc::now();
        let content = format!(
            "### Assistant - {}\n\n**Step:** {}\n\n```\n{}\n```\n\n",
            now.to_rfc3339(),
            step_id,
            text
        );

        self.append_to_log(&content)?;
        info!(step_id, chars = text.len(), "assistant answer");
        Ok(())
    }

    /// Log the terminal outcome of a step run.
    ///
    /// # Arguments
    /// * `step_id` - Step identifier.
    /// * `loop_count` - Loop at termination.
    /// * `outcome` - `DONE`, `MAX_LOOPS`, `WAIT_CLIENT` or `CANCELLED`.
    pub fn log_step_finished(&self, step_id: &str, loop_count: u32, outcome: &str) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let content = format!(
            "### Step Finished - {}\n\n**Step:** {}\n**Loop:** {}\n**Outcome:** {}\n\n---\n\n",
            now.to_rfc3339(),
            step_id,
            loop_count,
            outcome
        );

        self.append_to_log(&content)?;
        info!(step_id, loop_count, outcome, "step finished");
        Ok(())
    }

    /// Log an orchestrator failure.
    pub fn log_error(&self, step_id: &str, message: &str) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let content = format!(
            "### Error - {}\n\n**Step:** {}\n**Error:** {}\n\n",
            now.to_rfc3339(),
            step_id,
            message
        );

        self.append_to_log(&content)?;
        error!(step_id, message, "step failed");
        Ok(())
    }

    /// Get the log file path.
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Get the log level.
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[cfg(test)]
mod tests;
