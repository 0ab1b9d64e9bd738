//! Picks the reply for one request out of a shared conversation window.
//!
//! The backend offers no request/response linkage, so the echoed
//! `requestId` inside the reply payload is the only thing tying a reply to
//! its request. Anything else in the window (other requests' replies, user
//! turns, malformed output) is ignored.

use crate::channels::ChannelMessage;
use crate::util::parse_json_lenient;
use serde_json::{json, Map, Value};

/// Word of the sentinel item separating word entries from grammar notes.
pub const GRAMMAR_SENTINEL: &str = "— Grammar —";

/// Typed view of the rows the bridge synthesizes itself. Rows coming from
/// the backend are passed through as raw JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExplanationItem {
    pub word: String,
    pub reading: String,
    pub part_of_speech: String,
    pub meaning: String,
}

impl ExplanationItem {
    pub fn new(word: &str, reading: &str, part_of_speech: &str, meaning: &str) -> Self {
        Self {
            word: word.into(),
            reading: reading.into(),
            part_of_speech: part_of_speech.into(),
            meaning: meaning.into(),
        }
    }

    fn grammar_sentinel() -> Self {
        Self::new(GRAMMAR_SENTINEL, "", "", "")
    }

    fn from_grammar_note(note: &Value) -> Self {
        let field = |name: &str| note.get(name).and_then(Value::as_str).unwrap_or_default();
        let explanation = field("explanation");
        let example = field("example");
        let meaning = if example.trim().is_empty() {
            explanation.trim().to_string()
        } else {
            format!("{explanation} Example: {example}").trim().to_string()
        };
        Self::new(field("pattern"), "grammar", "pattern", &meaning)
    }

    /// Wire shape of the row, matching the backend's item objects.
    pub fn to_value(&self) -> Value {
        json!({
            "word": self.word,
            "reading": self.reading,
            "partOfSpeech": self.part_of_speech,
            "meaning": self.meaning,
        })
    }
}

/// Find the newest assistant reply addressed to `request_id` and return its
/// items unchanged, followed by the flattened grammar notes. `None` means
/// no matching reply yet.
pub fn match_reply(messages: &[ChannelMessage], request_id: &str) -> Option<Vec<Value>> {
    let target = request_id.trim();
    messages
        .iter()
        .rev()
        .filter(|msg| msg.is_assistant())
        .find_map(|msg| {
            let text = msg.plain_text();
            if text.is_empty() {
                return None;
            }
            // Only an object counts as a payload; arrays and strings fall
            // through to the brace span.
            let payload: Map<String, Value> = parse_json_lenient(&text)?;
            extract_items(&payload, target)
        })
}

fn extract_items(payload: &Map<String, Value>, target: &str) -> Option<Vec<Value>> {
    let reply_id = payload.get("requestId").and_then(Value::as_str)?;
    if reply_id.trim() != target {
        return None;
    }
    let mut items = payload.get("items").and_then(Value::as_array)?.clone();

    if let Some(grammar) = payload
        .get("grammar")
        .and_then(Value::as_array)
        .filter(|notes| !notes.is_empty())
    {
        items.push(ExplanationItem::grammar_sentinel().to_value());
        items.extend(
            grammar
                .iter()
                .map(|note| ExplanationItem::from_grammar_note(note).to_value()),
        );
    }

    Some(items)
}
