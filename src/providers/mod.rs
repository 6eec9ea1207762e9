// File: src/providers/mod.rs
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;

use crate::core::error::ProviderError;

pub mod gemini;

/// Common metadata map for provider hints/headers
pub type Metadata = HashMap<String, String>;

/// Roles supported for canonical messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Canonical text message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

/// Canonical usage counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
}

/// Canonical generate request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<Message>,

    #[serde(default)]
    pub temperature: Option<f32>,

    /// Canonical field to cap output tokens; providers map to their own keys
    #[serde(default)]
    pub max_output_tokens: Option<usize>,

    /// Optional provider metadata (extra headers)
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl GenerateRequest {
    /// Single-turn request
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message {
                role: Role::User,
                text: prompt.into(),
            }],
            ..Default::default()
        }
    }

    /// Text of the first user message; used as the coalescing key
    pub fn prompt_text(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.as_str())
            .unwrap_or_default()
    }
}

/// Canonical generate response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// Final text (provider-joined)
    pub text: String,
    #[serde(default)]
    pub usage: Option<Usage>,
    /// Provider raw JSON for diagnostics
    #[serde(default)]
    pub raw: Option<JsonValue>,
}

/// Provider trait for canonical generate APIs
#[async_trait]
pub trait Provider: Send + Sync {
    /// Model identifier requests are sent to
    fn model(&self) -> &str;

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError>;
}

/// Mapping helper: canonical -> Gemini generateContent body
pub fn map_internal_to_gemini(req: &GenerateRequest) -> JsonValue {
    let contents: Vec<JsonValue> = req
        .messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            json!({"role": role, "parts": [{"text": m.text}]})
        })
        .collect();

    let mut body = json!({ "contents": contents });

    if let Some(sys) = req.system.as_deref().filter(|s| !s.is_empty()) {
        body["systemInstruction"] = json!({"parts": [{"text": sys}]});
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = req.temperature {
        generation.insert("temperature".to_string(), json!(t));
    }
    if let Some(max) = req.max_output_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(max));
    }
    if !generation.is_empty() {
        body["generationConfig"] = JsonValue::Object(generation);
    }

    body
}
