use super::DelegationHook;
use crate::error::RetrievalError;
use crate::types::{Block, Delegation, TaskContext};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);

const STDERR_EXCERPT_CHARS: usize = 400;

/// External-agent-call hook: runs a program per block.
///
/// The program receives one JSON request on stdin
/// (`{"block", "body", "delegate", "task"}`) and answers with the block text
/// on stdout. The child is killed if the call times out or is dropped.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

#[derive(Serialize)]
struct AgentRequest<'a> {
    block: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    delegate: Option<&'a Delegation>,
    task: &'a TaskContext,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn failure(&self, message: impl Into<String>) -> RetrievalError {
        RetrievalError::Agent {
            agent: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl DelegationHook for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, block: &Block, ctx: &TaskContext) -> Result<String, RetrievalError> {
        let request = AgentRequest {
            block: block.name(),
            body: block.body(),
            delegate: block.delegate(),
            task: ctx,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|err| RetrievalError::InvalidRequest {
                message: err.to_string(),
            })?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|err| self.failure(format!("failed to spawn '{}': {err}", self.program)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.failure("child stdin unavailable"))?;

        log::debug!("Agent '{}' resolving block '{}'", self.name, block.name());

        let write = async move {
            let result = stdin.write_all(&payload).await;
            drop(stdin);
            match result {
                // Agents may answer without reading the request.
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let run = async move { tokio::join!(write, child.wait_with_output()) };

        let (written, output) = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| RetrievalError::Timeout {
                agent: self.name.clone(),
                after_ms: self.timeout.as_millis() as u64,
            })?;
        let output = output.map_err(|err| self.failure(format!("wait failed: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT_CHARS).collect();
            return Err(self.failure(format!("{}: {excerpt}", output.status)));
        }
        written.map_err(|err| self.failure(format!("failed to send request: {err}")))?;

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(RetrievalError::EmptyResponse {
                agent: self.name.clone(),
            });
        }
        Ok(text)
    }
}
