use serde_json::{json, Map, Value};

use crate::error::ServiceError;
use crate::openai::OpenAiClient;

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    /// `https://` or `data:` URL.
    ImageUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn user(content: Vec<ContentPart>) -> Self {
        Self {
            role: ChatRole::User,
            content,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentPart::Text(text.into())])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::ImageUrl(_) => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn image_urls(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ImageUrl(url) => Some(url.as_str()),
                ContentPart::Text(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u64>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u64>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Chat-completion backend. Implementations must tolerate concurrent calls.
pub trait LanguageModel: Send + Sync {
    fn complete(&self, request: &ChatRequest) -> Result<String, ServiceError>;
}

pub struct OpenAiChatModel {
    client: OpenAiClient,
}

impl OpenAiChatModel {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

impl LanguageModel for OpenAiChatModel {
    fn complete(&self, request: &ChatRequest) -> Result<String, ServiceError> {
        let payload = chat_completions_payload(request);
        let response = self.client.post_json(CHAT_COMPLETIONS_PATH, &payload)?;
        extract_chat_text(&response)
            .map_err(|reason| ServiceError::malformed(&self.client.endpoint(CHAT_COMPLETIONS_PATH), reason))
    }
}

pub fn chat_completions_payload(request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_to_value).collect();
    let mut payload = Map::new();
    payload.insert("model".to_string(), Value::String(request.model.clone()));
    payload.insert("messages".to_string(), Value::Array(messages));
    if let Some(max_tokens) = request.max_tokens {
        payload.insert("max_tokens".to_string(), Value::Number(max_tokens.into()));
    }
    Value::Object(payload)
}

fn message_to_value(message: &ChatMessage) -> Value {
    let has_images = message
        .content
        .iter()
        .any(|part| matches!(part, ContentPart::ImageUrl(_)));
    if !has_images {
        return json!({
            "role": message.role.as_str(),
            "content": message.text(),
        });
    }
    let parts: Vec<Value> = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => json!({"type": "text", "text": text}),
            ContentPart::ImageUrl(url) => json!({"type": "image_url", "image_url": {"url": url}}),
        })
        .collect();
    json!({
        "role": message.role.as_str(),
        "content": parts,
    })
}

/// Text of `choices[0].message.content`, string or list-of-parts form.
pub fn extract_chat_text(response: &Value) -> Result<String, String> {
    let Some(message) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
    else {
        return Err("response has no choices[0].message".to_string());
    };

    match message.get("content") {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(parts)) => Ok(parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("")),
        _ => {
            let refusal = message
                .get("refusal")
                .and_then(Value::as_str)
                .unwrap_or("no content");
            Err(format!("message carries no text ({refusal})"))
        }
    }
}
