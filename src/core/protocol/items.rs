//! Conversation items and message-text extraction.
//!
//! Items arrive in several shapes depending on who created them and how:
//! typed text, server-transcribed audio, assistant audio with a transcript,
//! or (from older servers) a bare string. [`ConversationItem::extract_text`]
//! resolves them with a fixed priority:
//!
//! 1. `input_text` parts
//! 2. `text` parts
//! 3. `audio` part transcripts
//! 4. `input_audio` part transcripts
//! 5. string content
//!
//! The first non-empty candidate in that order wins.

use serde::{Deserialize, Serialize};

/// Content part within a conversation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "input_audio")]
    InputAudio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },

    #[serde(rename = "audio")]
    Audio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

/// Item content: a list of typed parts or a plain string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemContent {
    Parts(Vec<ContentPart>),
    Text(String),
}

/// Conversation item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Item ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item type (message, function_call, function_call_output)
    #[serde(rename = "type", default)]
    pub item_type: String,
    /// Item status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Item role (user, assistant, system)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ItemContent>,
    /// Call ID for function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Function name for function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Function arguments for function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Function output for function call result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ConversationItem {
    /// A user text message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(ItemContent::Parts(vec![ContentPart::InputText {
                text: text.into(),
            }])),
            ..Default::default()
        }
    }

    /// A system message; used for spoken status notices.
    pub fn system_text(text: impl Into<String>) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("system".to_string()),
            content: Some(ItemContent::Parts(vec![ContentPart::InputText {
                text: text.into(),
            }])),
            ..Default::default()
        }
    }

    /// The result of a function call.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            item_type: "function_call_output".to_string(),
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn is_message(&self) -> bool {
        self.item_type == "message"
    }

    pub fn is_function_call(&self) -> bool {
        self.item_type == "function_call"
    }

    /// Resolve the item's text using the documented priority order.
    pub fn extract_text(&self) -> Option<String> {
        let parts = match self.content.as_ref()? {
            ItemContent::Text(text) => return non_empty(text),
            ItemContent::Parts(parts) => parts,
        };

        let input_text = parts.iter().find_map(|p| match p {
            ContentPart::InputText { text } => non_empty(text),
            _ => None,
        });
        let text = || {
            parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => non_empty(text),
                _ => None,
            })
        };
        let audio_transcript = || {
            parts.iter().find_map(|p| match p {
                ContentPart::Audio { transcript, .. } => transcript.as_deref().and_then(non_empty),
                _ => None,
            })
        };
        let input_audio_transcript = || {
            parts.iter().find_map(|p| match p {
                ContentPart::InputAudio { transcript, .. } => {
                    transcript.as_deref().and_then(non_empty)
                }
                _ => None,
            })
        };

        input_text
            .or_else(text)
            .or_else(audio_transcript)
            .or_else(input_audio_transcript)
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
