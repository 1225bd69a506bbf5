use anyhow::{anyhow, Result};
use std::process::{Command, Stdio};

const ERROR_TAIL_CHARS: usize = 2048;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Runs an argv list to completion, blocking the caller.
pub fn run_argv(argv: &[String]) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command argv is empty"))?;
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| anyhow!("failed to spawn '{}': {}", program, e))?;
    Ok(CommandOutput {
        status_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Like [`run_argv`] but a non-zero exit becomes an error labelled with `label`.
pub fn run_argv_checked(argv: &[String], label: &str) -> Result<CommandOutput> {
    let output = run_argv(argv)?;
    if !output.success() {
        let code = output
            .status_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(anyhow!(
            "{} failed (exit {}): {}",
            label,
            code,
            truncate_tail(output.stderr.trim(), ERROR_TAIL_CHARS)
        ));
    }
    Ok(output)
}

pub fn truncate_tail(raw: &str, max_chars: usize) -> String {
    let count = raw.chars().count();
    if count <= max_chars {
        return raw.to_string();
    }
    let tail: String = raw.chars().skip(count - max_chars).collect();
    format!("...{}", tail)
}
