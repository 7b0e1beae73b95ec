//! Extracts `(id, sender, content)` out of an MCP `messages` tool result,
//! across the several shapes different remote message servers return
//! (`spec.md` §4.5), grounded on `queue_manager.py::_parse_message`.
//!
//! Three tiers are tried in order, the first one that yields structured
//! data wins:
//!
//! 1. `result.messages[]` — an array of message objects, each checked for
//!    a direct `@agent` mention and filtered for self-mentions.
//! 2. `result.events[]` — an older event-shaped array; the first entry is
//!    taken unconditionally, with no mention/self-mention filtering (this
//!    matches the original, which trusts the event stream is pre-filtered
//!    to mentions of this agent).
//! 3. `result.content` — free text, either a single `{text: ...}` object or
//!    an array of them. Status strings (`"WAIT SUCCESS"`, `"No mentions"`)
//!    are treated as "nothing to do"; otherwise an `[id:...]` tag and a
//!    `• sender: @mention body` line are extracted with regexes.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
}

fn message_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[id:([a-f0-9-]+)\]").unwrap())
}

fn mention_line_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"• ([^:]+): (@\S+)\s+(.+)").unwrap())
}

/// Builds the direct-mention regex for `agent_name`: matches `@name` only
/// at the start of the text or after whitespace, followed by whitespace or
/// end of text, so a mention inside a longer word or task description
/// doesn't count (`spec.md` §4.5).
fn direct_mention_pattern(agent_name: &str) -> Regex {
    let escaped = regex::escape(agent_name);
    Regex::new(&format!(r"(?:^|[\s\n])@{escaped}(?:[\s\n]|$)")).expect("escaped agent name is always a valid regex")
}

/// Parses a raw MCP `messages`-tool result into a single mentioning
/// message for `agent_name`, or `None` if there is nothing to act on.
pub fn parse_messages_result(result: &Value, agent_name: &str) -> Option<ParsedMessage> {
    if let Some(found) = parse_structured_messages(result, agent_name) {
        return found;
    }
    if let Some(found) = parse_events(result) {
        return Some(found);
    }
    parse_text_content(result, agent_name)
}

/// Tier 1. Returns `None` when there is no `messages` array, or when it is
/// present but empty — an empty list is falsy, just as it is in the
/// original, and falls through to the `events`/`content` tiers. Returns
/// `Some(None)` only once a non-empty list has been scanned in full with no
/// matching, non-self mention, which is a terminal "nothing to do" result.
fn parse_structured_messages(result: &Value, agent_name: &str) -> Option<Option<ParsedMessage>> {
    let messages = result.get("messages")?.as_array()?;
    if messages.is_empty() {
        return None;
    }
    let mention = direct_mention_pattern(agent_name);

    for msg in messages {
        let content = msg.get("content").and_then(Value::as_str).unwrap_or("");
        if !mention.is_match(content) {
            continue;
        }
        let sender = msg.get("sender_name").and_then(Value::as_str).unwrap_or("unknown");
        if sender == agent_name {
            tracing::warn!(%sender, "skipping self-mention");
            continue;
        }
        let id = msg.get("id").and_then(Value::as_str).unwrap_or("unknown");
        return Some(Some(ParsedMessage {
            id: id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
        }));
    }
    Some(None)
}

/// Tier 2. The first event is trusted unconditionally: this shape is only
/// emitted by servers that already filter to this agent's mentions.
fn parse_events(result: &Value) -> Option<ParsedMessage> {
    let event = result.get("events")?.as_array()?.first()?;
    Some(ParsedMessage {
        id: event.get("id").and_then(Value::as_str).unwrap_or("unknown").to_string(),
        sender: event
            .get("sender_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        content: event.get("content").and_then(Value::as_str).unwrap_or("").to_string(),
    })
}

/// Tier 3. Free-text `content`, as either `{text: ...}` or `[{text: ...}]`.
fn parse_text_content(result: &Value, agent_name: &str) -> Option<ParsedMessage> {
    let content = result.get("content")?;
    let messages_data = if let Some(text) = content.get("text").and_then(Value::as_str) {
        text
    } else {
        content.as_array()?.first()?.get("text")?.as_str()?
    };
    if messages_data.is_empty() {
        return None;
    }
    if messages_data.contains("WAIT SUCCESS") || messages_data.contains("No mentions") {
        return None;
    }

    let message_id = message_id_pattern()
        .captures(messages_data)?
        .get(1)?
        .as_str()
        .to_string();

    mention_line_pattern().captures(messages_data)?;

    let mention_tag = format!("@{agent_name}");
    if !messages_data.contains(&mention_tag) {
        return None;
    }

    let sender = mention_line_pattern()
        .captures(messages_data)?
        .get(1)?
        .as_str()
        .trim()
        .to_string();

    if sender == agent_name {
        tracing::warn!(%sender, "skipping self-mention");
        return None;
    }

    Some(ParsedMessage {
        id: message_id,
        sender,
        content: messages_data.to_string(),
    })
}
