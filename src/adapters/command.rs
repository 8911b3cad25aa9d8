//! Subprocess generation client.
//!
//! Spawns a configured program, pipes the prompt to stdin, and reads the
//! artifact payload from stdout. The exit code is the classification
//! contract between the program and the dispatch engine.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::domain::ErrorKind;

use super::{GenerateOptions, GeneratedArtifact, GenerationClient, GenerationError};

/// Exit codes that map to each error kind (anything else is FatalUnknown)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitCodeMap {
    #[serde(default = "default_transient")]
    pub transient: Vec<i32>,

    #[serde(default = "default_quota")]
    pub quota: Vec<i32>,

    #[serde(default = "default_input")]
    pub input: Vec<i32>,

    #[serde(default = "default_auth")]
    pub auth: Vec<i32>,
}

fn default_transient() -> Vec<i32> {
    vec![75] // EX_TEMPFAIL
}
fn default_quota() -> Vec<i32> {
    vec![29]
}
fn default_input() -> Vec<i32> {
    vec![65] // EX_DATAERR
}
fn default_auth() -> Vec<i32> {
    vec![77] // EX_NOPERM
}

impl Default for ExitCodeMap {
    fn default() -> Self {
        Self {
            transient: default_transient(),
            quota: default_quota(),
            input: default_input(),
            auth: default_auth(),
        }
    }
}

impl ExitCodeMap {
    /// Classify a non-zero exit code
    pub fn classify(&self, code: Option<i32>) -> ErrorKind {
        let Some(code) = code else {
            // Killed by a signal
            return ErrorKind::RetryableTransient;
        };

        if self.transient.contains(&code) {
            ErrorKind::RetryableTransient
        } else if self.quota.contains(&code) {
            ErrorKind::RetryableQuota
        } else if self.input.contains(&code) {
            ErrorKind::FatalInput
        } else if self.auth.contains(&code) {
            ErrorKind::FatalAuth
        } else {
            ErrorKind::FatalUnknown
        }
    }
}

/// Generation client backed by an external program
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    call_timeout: Duration,
    content_type: String,
    exit_codes: ExitCodeMap,
}

impl CommandGenerator {
    /// Create a generator for `program` with default settings
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            call_timeout: Duration::from_secs(120),
            content_type: "image/png".to_string(),
            exit_codes: ExitCodeMap::default(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_exit_codes(mut self, exit_codes: ExitCodeMap) -> Self {
        self.exit_codes = exit_codes;
        self
    }

    async fn run_program(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<Vec<u8>, GenerationError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("GENBATCH_RESOURCE", &options.resource)
            .env("GENBATCH_CATEGORY", &options.category)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &options.metadata {
            command.env(format!("GENBATCH_META_{}", key.to_uppercase()), value);
        }

        let mut child = command.spawn().map_err(|e| {
            GenerationError::unknown(format!("Failed to spawn '{}': {}", self.program, e))
        })?;

        // Feed the prompt while collecting output, both under one deadline.
        // stdin is dropped once written, which signals EOF.
        let stdin = child.stdin.take();
        let write_prompt = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(prompt.as_bytes()).await {
                // Program exited without reading; its exit code decides
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                result => result,
            }
        };

        let (written, output) = timeout(self.call_timeout, async {
            tokio::join!(write_prompt, child.wait_with_output())
        })
        .await
        .map_err(|_| {
            GenerationError::transient(format!(
                "'{}' timed out after {:?}",
                self.program, self.call_timeout
            ))
        })?;

        written.map_err(|e| {
            GenerationError::transient(format!("Failed to write prompt to stdin: {}", e))
        })?;
        let output = output.map_err(|e| {
            GenerationError::transient(format!("Failed to wait for '{}': {}", self.program, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code();
            let kind = self.exit_codes.classify(code);
            return Err(GenerationError::new(
                kind,
                format!(
                    "'{}' exited with code {}: {}",
                    self.program,
                    code.unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }

        if output.stdout.is_empty() {
            return Err(GenerationError::unknown(format!(
                "'{}' produced an empty payload",
                self.program
            )));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl GenerationClient for CommandGenerator {
    fn name(&self) -> &str {
        "command"
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GeneratedArtifact, GenerationError> {
        let payload = self.run_program(prompt, options).await?;
        Ok(GeneratedArtifact::new(payload, self.content_type.clone()))
    }
}
