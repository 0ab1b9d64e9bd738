//! OpenClaw gateway channel driven through the `openclaw` CLI.
//!
//! Every operation is a one-shot `openclaw gateway call <method> --params <json>`
//! process. Some CLI versions print a human-readable line (for example
//! `Gateway call: chat.send ...`) before the JSON envelope, so stdout is
//! decoded leniently.

use super::traits::{ChannelError, ChannelMessage, ChatChannel, SendAck};
use crate::config::BridgeConfig;
use crate::util::{output_preview, parse_json_lenient};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const METHOD_SEND: &str = "chat.send";
const METHOD_HISTORY: &str = "chat.history";
const METHOD_ABORT: &str = "chat.abort";

#[derive(Debug, Default, Deserialize)]
struct HistoryEnvelope {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

/// `ChatChannel` backed by the local `openclaw` binary.
#[derive(Debug, Clone)]
pub struct OpenClawChannel {
    bin: String,
    working_dir: Option<PathBuf>,
    path_env: String,
    call_timeout: Duration,
}

impl OpenClawChannel {
    pub fn new(bin: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            working_dir: None,
            path_env: String::new(),
            call_timeout,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            bin: config.openclaw_bin.clone(),
            working_dir: config.working_dir.clone(),
            path_env: config.path_env.clone(),
            call_timeout: config.call_timeout(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_path_env(mut self, path_env: impl Into<String>) -> Self {
        self.path_env = path_env.into();
        self
    }

    fn build_command(&self, method: &str, params: &serde_json::Value) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("gateway")
            .arg("call")
            .arg(method)
            .arg("--params")
            .arg(params.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        if !self.path_env.trim().is_empty() {
            cmd.env("PATH", &self.path_env);
        }
        cmd
    }

    /// Run one gateway call and decode its stdout envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ChannelError> {
        let child = self
            .build_command(method, &params)
            .spawn()
            .map_err(|e| ChannelError::Unavailable(format!("failed to spawn {}: {e}", self.bin)))?;

        // Dropping the future (cancellation, timeout) kills the child.
        let output = match tokio::time::timeout(self.call_timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ChannelError::Unavailable(format!(
                    "{method} failed to complete: {e}"
                )))
            }
            Err(_) => {
                return Err(ChannelError::Unavailable(format!(
                    "{method} timed out after {}s",
                    self.call_timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let detail = if stderr.is_empty() {
                format!("{method} exited with {}", output.status)
            } else {
                output_preview(stderr)
            };
            return Err(ChannelError::Unavailable(detail));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        decode_envelope(&stdout)
    }
}

/// Decode a CLI envelope, tolerating diagnostic text around the JSON object.
pub fn decode_envelope<T: DeserializeOwned>(raw: &str) -> Result<T, ChannelError> {
    parse_json_lenient(raw).ok_or_else(|| ChannelError::MalformedEnvelope {
        preview: output_preview(raw),
    })
}

#[async_trait]
impl ChatChannel for OpenClawChannel {
    fn name(&self) -> &str {
        "openclaw"
    }

    async fn submit(
        &self,
        session_key: &str,
        message: &str,
        idempotency_key: &str,
        deliver: bool,
    ) -> Result<SendAck, ChannelError> {
        self.call(
            METHOD_SEND,
            json!({
                "sessionKey": session_key,
                "message": message,
                "deliver": deliver,
                "idempotencyKey": idempotency_key,
            }),
        )
        .await
    }

    async fn fetch_recent(
        &self,
        session_key: &str,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, ChannelError> {
        let envelope: HistoryEnvelope = self
            .call(
                METHOD_HISTORY,
                json!({
                    "sessionKey": session_key,
                    "limit": limit,
                }),
            )
            .await?;

        Ok(envelope
            .messages
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<ChannelMessage>(raw) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    tracing::debug!("Skipping unreadable history entry: {e}");
                    None
                }
            })
            .collect())
    }

    async fn abort_session(&self, session_key: &str) -> Result<(), ChannelError> {
        let _: serde_json::Value = self
            .call(METHOD_ABORT, json!({ "sessionKey": session_key }))
            .await?;
        Ok(())
    }
}
