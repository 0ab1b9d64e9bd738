//! Correlation coordinator: submit, poll, match, under a deadline and an
//! abort signal.

use super::matcher::match_reply;
use super::prompt::{build_explain_prompt, generate_request_id};
use super::registry::InFlightRegistry;
use super::BridgeError;
use crate::channels::ChatChannel;
use crate::config::BridgeConfig;
use crate::util::truncate_with_ellipsis;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Timing and defaults for explain calls.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub history_limit: usize,
    pub abort_timeout: Duration,
    pub default_session_key: String,
    pub default_language: String,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for PollSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            poll_interval: config.poll_interval(),
            poll_attempts: config.poll_attempts,
            history_limit: config.history_limit,
            abort_timeout: config.abort_timeout(),
            default_session_key: config.default_session_key.clone(),
            default_language: config.default_language.clone(),
        }
    }
}

/// One explain call. Unset fields fall back to [`PollSettings`].
#[derive(Debug, Clone, Default)]
pub struct ExplainRequest {
    pub text: String,
    pub session_key: Option<String>,
    pub user_language: Option<String>,
    pub request_id: Option<String>,
    pub deadline: Option<Duration>,
}

impl ExplainRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.user_language = Some(language.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Successful explain result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainOutcome {
    pub request_id: String,
    pub session_key: String,
    pub items: Vec<Value>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Registry membership for the lifetime of one explain call. Dropping it
/// (for example when the HTTP client disconnects and the handler future is
/// dropped) releases the entry.
struct Registration<'a> {
    registry: &'a InFlightRegistry,
    request_id: &'a str,
    task_id: Option<u64>,
}

impl<'a> Registration<'a> {
    fn new(
        registry: &'a InFlightRegistry,
        request_id: &'a str,
        cancellation: CancellationToken,
        session_key: &str,
    ) -> Self {
        let task_id = registry.register(request_id, cancellation, session_key);
        Self {
            registry,
            request_id,
            task_id,
        }
    }

    /// Release the entry. `false` means someone else claimed it first.
    fn finish(mut self) -> bool {
        self.task_id
            .take()
            .is_some_and(|task_id| self.registry.release(self.request_id, task_id))
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(task_id) = self.task_id.take() {
            self.registry.release(self.request_id, task_id);
        }
    }
}

/// Runs explain calls against a shared chat channel and routes aborts to
/// the right in-flight call.
pub struct ExplainCoordinator {
    channel: Arc<dyn ChatChannel>,
    registry: InFlightRegistry,
    settings: PollSettings,
}

impl ExplainCoordinator {
    pub fn new(channel: Arc<dyn ChatChannel>, settings: PollSettings) -> Self {
        Self {
            channel,
            registry: InFlightRegistry::new(),
            settings,
        }
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    /// Explain `request.text` and wait for the correlated reply.
    pub async fn explain(&self, request: ExplainRequest) -> Result<ExplainOutcome, BridgeError> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(BridgeError::InvalidRequest("missing text".into()));
        }
        let request_id = non_blank(request.request_id.as_deref())
            .map(ToOwned::to_owned)
            .unwrap_or_else(generate_request_id);
        let session_key = non_blank(request.session_key.as_deref())
            .unwrap_or(&self.settings.default_session_key)
            .to_string();
        let language =
            non_blank(request.user_language.as_deref()).unwrap_or(&self.settings.default_language);
        let deadline = request.deadline.unwrap_or(self.settings.request_timeout);

        let cancellation = CancellationToken::new();
        let registration = Registration::new(
            &self.registry,
            &request_id,
            cancellation.clone(),
            &session_key,
        );

        tracing::info!(
            request_id = %request_id,
            session_key = %session_key,
            language,
            "Explain request started: {}",
            truncate_with_ellipsis(text, 80)
        );
        let started_at = Instant::now();

        let outcome = tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(BridgeError::Canceled {
                request_id: request_id.clone(),
            }),
            result = tokio::time::timeout(
                deadline,
                self.submit_and_poll(&request_id, &session_key, language, text),
            ) => result.unwrap_or_else(|_| Err(BridgeError::Timeout {
                request_id: request_id.clone(),
            })),
        };

        // An abort that claimed the entry wins over whatever finished
        // concurrently, so the caller sees exactly one outcome.
        let still_owned = registration.finish();
        let outcome = if !still_owned && cancellation.is_cancelled() {
            Err(BridgeError::Canceled {
                request_id: request_id.clone(),
            })
        } else {
            outcome
        };

        let elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            Ok(items) => tracing::info!(
                request_id = %request_id,
                items = items.len(),
                elapsed_ms,
                "Explain request completed"
            ),
            Err(e) => tracing::warn!(
                request_id = %request_id,
                elapsed_ms,
                "Explain request failed: {e}"
            ),
        }

        outcome.map(|items| ExplainOutcome {
            request_id,
            session_key,
            items,
        })
    }

    async fn submit_and_poll(
        &self,
        request_id: &str,
        session_key: &str,
        language: &str,
        text: &str,
    ) -> Result<Vec<Value>, BridgeError> {
        let prompt = build_explain_prompt(text, language, request_id);
        self.channel
            .submit(session_key, &prompt, request_id, false)
            .await
            .map_err(BridgeError::Submit)?;
        tracing::debug!(request_id, session_key, "Submitted explain prompt");

        for attempt in 1..=self.settings.poll_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;

            let messages = match self
                .channel
                .fetch_recent(session_key, self.settings.history_limit)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(request_id, attempt, "History fetch failed, retrying: {e}");
                    continue;
                }
            };

            if let Some(items) = match_reply(&messages, request_id) {
                tracing::debug!(request_id, attempt, "Matched reply");
                return Ok(items);
            }
            tracing::debug!(
                request_id,
                attempt,
                window = messages.len(),
                "No matching reply yet"
            );
        }

        Err(BridgeError::Timeout {
            request_id: request_id.to_string(),
        })
    }

    /// Cancel an in-flight request. Returns `false` for unknown or already
    /// finished ids.
    pub fn abort(&self, request_id: &str) -> bool {
        let request_id = request_id.trim();
        let Some(session_key) = self.registry.cancel(request_id) else {
            tracing::debug!(request_id, "Abort for unknown request ignored");
            return false;
        };
        tracing::info!(request_id, session_key = %session_key, "Explain request aborted");

        // Detached, fire-and-forget: the local wait is already cancelled and
        // nobody consumes the backend's answer to this.
        let channel = Arc::clone(&self.channel);
        let abort_timeout = self.settings.abort_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(abort_timeout, channel.abort_session(&session_key)).await {
                Ok(Ok(())) => tracing::debug!(session_key = %session_key, "Session abort sent"),
                Ok(Err(e)) => {
                    tracing::debug!(session_key = %session_key, "Session abort failed: {e}");
                }
                Err(_) => tracing::debug!(session_key = %session_key, "Session abort timed out"),
            }
        });
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::channels::{ChannelError, ChannelMessage, ChatChannel, SendAck};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedSubmit {
        pub session_key: String,
        pub message: String,
        pub idempotency_key: String,
        pub deliver: bool,
    }

    /// In-memory channel with a scripted history.
    #[derive(Default)]
    pub struct ScriptedChannel {
        pub history: Mutex<Vec<ChannelMessage>>,
        pub submits: Mutex<Vec<RecordedSubmit>>,
        pub aborts: Mutex<Vec<String>>,
        pub fetches: AtomicUsize,
        /// Append a matching reply once this many fetches have happened.
        pub reply_on_fetch: Option<usize>,
        /// Fail this many initial fetches.
        pub failing_fetches: usize,
        pub fail_submit: bool,
    }

    impl ScriptedChannel {
        pub fn replying_on_fetch(n: usize) -> Self {
            Self {
                reply_on_fetch: Some(n),
                ..Self::default()
            }
        }

        pub fn with_history(messages: Vec<ChannelMessage>) -> Self {
            Self {
                history: Mutex::new(messages),
                ..Self::default()
            }
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        pub fn reply_for(request_id: &str, word: &str) -> ChannelMessage {
            ChannelMessage::assistant(
                &json!({"requestId": request_id, "items": [{"word": word}]}).to_string(),
            )
        }
    }

    #[async_trait]
    impl ChatChannel for ScriptedChannel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn submit(
            &self,
            session_key: &str,
            message: &str,
            idempotency_key: &str,
            deliver: bool,
        ) -> Result<SendAck, ChannelError> {
            if self.fail_submit {
                return Err(ChannelError::Unavailable("gateway not running".into()));
            }
            self.submits.lock().push(RecordedSubmit {
                session_key: session_key.into(),
                message: message.into(),
                idempotency_key: idempotency_key.into(),
                deliver,
            });
            self.history.lock().push(ChannelMessage::user(message));
            Ok(SendAck::default())
        }

        async fn fetch_recent(
            &self,
            _session_key: &str,
            limit: usize,
        ) -> Result<Vec<ChannelMessage>, ChannelError> {
            let count = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            if count <= self.failing_fetches {
                return Err(ChannelError::MalformedEnvelope {
                    preview: "Gateway call: chat.history".into(),
                });
            }
            if self.reply_on_fetch == Some(count) {
                let last_key = self
                    .submits
                    .lock()
                    .last()
                    .map(|s| s.idempotency_key.clone())
                    .unwrap_or_default();
                self.history
                    .lock()
                    .push(Self::reply_for(&last_key, "scripted"));
            }
            let history = self.history.lock();
            let start = history.len().saturating_sub(limit);
            Ok(history[start..].to_vec())
        }

        async fn abort_session(&self, session_key: &str) -> Result<(), ChannelError> {
            self.aborts.lock().push(session_key.into());
            Ok(())
        }
    }
}
