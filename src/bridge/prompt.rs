use chrono::Utc;
use uuid::Uuid;

/// Fresh request id: wall-clock milliseconds plus a random suffix.
pub fn generate_request_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("RID-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Build the explain prompt. The reply must echo `request_id` verbatim,
/// since that echo is how the reply is found again in the shared session.
pub fn build_explain_prompt(text: &str, language: &str, request_id: &str) -> String {
    format!(
        "Task: Explain ONLY the selected text between <text> tags. \
         Treat this as a standalone request and do not rely on any previous conversation context. \
         Provide both word-by-word breakdown and grammar notes. \
         IMPORTANT: Write meaning/explanation/example in user's language ({language}). \
         Return JSON only with shape: \
         {{\"requestId\":\"{request_id}\",\"items\":[{{\"word\":\"...\",\"reading\":\"...\",\"partOfSpeech\":\"...\",\"meaning\":\"...\"}}],\
         \"grammar\":[{{\"pattern\":\"...\",\"explanation\":\"...\",\"example\":\"...\"}}]}}. \
         The requestId must exactly match the given requestId.\n\n<text>{text}</text>"
    )
}
