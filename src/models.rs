//! Local model discovery and warm-up through the model CLI.

use anyhow::{anyhow, Context, Result};
use std::process::Stdio;
use tokio::process::Command;

/// Model names from `ollama list` output: the first column of every row,
/// skipping the `NAME ...` header when present.
pub fn parse_model_list(stdout: &str) -> Vec<String> {
    let mut lines = stdout.trim().lines().peekable();

    if lines.peek().is_some_and(|first| first.starts_with("NAME")) {
        lines.next();
    }

    lines
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct ModelCli {
    program: String,
}

impl ModelCli {
    pub fn new(program: impl Into<String>) -> Self {
        ModelCli {
            program: program.into(),
        }
    }

    /// Installed models. Any failure is logged and reads as "none installed".
    pub async fn list(&self) -> Vec<String> {
        match self.try_list().await {
            Ok(models) => {
                tracing::info!("found {} local model(s)", models.len());
                models
            }
            Err(e) => {
                tracing::error!("listing models failed: {:#}", e);
                Vec::new()
            }
        }
    }

    async fn try_list(&self) -> Result<Vec<String>> {
        let stdout = self.run_captured(&["list"]).await?;
        Ok(parse_model_list(&stdout))
    }

    /// One-shot `run <model>` with stdin closed, which loads the model into
    /// memory and exits.
    pub async fn warm_up(&self, model: &str) -> Result<()> {
        tracing::info!("warming up {}", model);
        let stdout = self.run_captured(&["run", model]).await?;
        if !stdout.trim().is_empty() {
            tracing::debug!("{} run output: {}", self.program, stdout.trim());
        }
        Ok(())
    }

    async fn run_captured(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to start `{}`", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "`{} {}` exited with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
