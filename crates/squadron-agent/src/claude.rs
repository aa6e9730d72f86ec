use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use squadron_core::agent_session::{AgentSession, ToolOutcome, TurnResult};
use squadron_core::sandbox::{Sandbox, SandboxMode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Runs Claude Code as a subprocess inside the configured sandbox. One
/// instance is shared across every spawned agent; `worktree_path` and
/// `session_id` scope each call to a particular agent's conversation.
pub struct ClaudeBackend {
    pub claude_bin: String,
    pub sandbox_mode: SandboxMode,
    pub docker_image: String,
    /// Kills the subprocess and reports a failed turn after this many
    /// seconds; `0` disables the timeout.
    pub timeout_s: u64,
    pub model: String,
    pub allowed_tools: String,
    pub max_turns: u32,
    pub session_dir: String,
}

impl ClaudeBackend {
    pub fn new(claude_bin: impl Into<String>, sandbox_mode: SandboxMode, docker_image: impl Into<String>) -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        Self {
            claude_bin: claude_bin.into(),
            sandbox_mode,
            docker_image: docker_image.into(),
            timeout_s: 0,
            model: "claude-sonnet-4-5".to_string(),
            allowed_tools: "Read,Glob,Grep,Write,Edit,Bash".to_string(),
            max_turns: 200,
            session_dir: format!("{home}/.squadron"),
        }
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn run(&self, worktree_path: &str, resume: Option<&str>, instruction: &str) -> Result<TurnResult> {
        let mut args = vec![
            "--model".to_string(),
            self.model.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--allowedTools".to_string(),
            self.allowed_tools.clone(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
        ];
        if let Some(session_id) = resume {
            args.push("--resume".to_string());
            args.push(session_id.to_string());
        }
        args.push("--print".to_string());
        args.push(instruction.to_string());

        let mut full_cmd: Vec<String> = vec![self.claude_bin.clone()];
        full_cmd.extend(args);

        info!(worktree_path, resume = ?resume, "spawning claude subprocess");

        let mut child = match &self.sandbox_mode {
            SandboxMode::Bwrap => {
                let writable = [worktree_path, self.session_dir.as_str()];
                Sandbox::bwrap_command(&writable, worktree_path, &full_cmd)
                    .kill_on_drop(true)
                    .env("HOME", &self.session_dir)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .context("failed to spawn bwrap")?
            }
            SandboxMode::Docker => {
                let binds = [(worktree_path, worktree_path), (self.session_dir.as_str(), self.session_dir.as_str())];
                Sandbox::docker_command(&self.docker_image, &binds, worktree_path, &full_cmd)
                    .kill_on_drop(true)
                    .env("HOME", &self.session_dir)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .context("failed to spawn docker")?
            }
            SandboxMode::Direct => Command::new(&self.claude_bin)
                .args(&full_cmd[1..])
                .kill_on_drop(true)
                .current_dir(worktree_path)
                .env("HOME", &self.session_dir)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?,
        };

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let timeout_s = self.timeout_s;

        let io_future = async move {
            let mut raw_stream = String::new();
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line.context("error reading stdout")? {
                            Some(l) => {
                                raw_stream.push_str(&l);
                                raw_stream.push('\n');
                            }
                            None => break,
                        }
                    }
                    line = stderr_reader.next_line() => {
                        if let Ok(Some(l)) = line {
                            if !l.is_empty() {
                                warn!("claude stderr: {}", l);
                            }
                        }
                    }
                }
            }
            while let Ok(Some(l)) = stderr_reader.next_line().await {
                if !l.is_empty() {
                    warn!("claude stderr: {}", l);
                }
            }
            let exit_status = child.wait().await.context("failed to wait for claude")?;
            anyhow::Ok((raw_stream, exit_status.success()))
        };

        let (raw_stream, success) = if timeout_s > 0 {
            match tokio::time::timeout(std::time::Duration::from_secs(timeout_s), io_future).await {
                Ok(result) => result?,
                Err(_elapsed) => {
                    warn!(worktree_path, timeout_s, "claude subprocess timed out");
                    return Ok(TurnResult {
                        output_text: String::new(),
                        session_id: resume.map(str::to_string),
                        outcome: ToolOutcome::Suspend { reason: "turn timed out".into() },
                        tool_call_count: 0,
                    });
                }
            }
        } else {
            io_future.await?
        };

        let (output_text, new_session_id) = crate::event::parse_stream(&raw_stream);
        let session_id = new_session_id.or_else(|| resume.map(str::to_string));
        let tool_call_count = raw_stream.matches("\"tool_use\"").count() as u32;

        info!(worktree_path, success, session_id = ?session_id, "claude subprocess finished");

        Ok(TurnResult {
            output_text,
            session_id,
            outcome: if success { ToolOutcome::Continue } else { ToolOutcome::Suspend { reason: "claude exited non-zero".into() } },
            tool_call_count,
        })
    }
}

#[async_trait]
impl AgentSession for ClaudeBackend {
    async fn create(&self, worktree_path: &str, instruction: &str) -> Result<TurnResult> {
        self.run(worktree_path, None, instruction).await
    }

    async fn resume(&self, worktree_path: &str, session_id: &str, instruction: &str) -> Result<TurnResult> {
        self.run(worktree_path, Some(session_id), instruction).await
    }
}
