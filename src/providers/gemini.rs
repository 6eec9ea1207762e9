// File: src/providers/gemini.rs
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::core::config::GeminiConfig;
use crate::core::error::ProviderError;
use crate::providers::{map_internal_to_gemini, GenerateRequest, GenerateResponse, Provider, Usage};

/// Gemini provider using the generateContent endpoint
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_output_tokens: Option<usize>,
    temperature: Option<f32>,
}

impl GeminiProvider {
    /// Create a Gemini provider from GeminiConfig
    pub fn from_config(cfg: &GeminiConfig) -> Result<Self, ProviderError> {
        if cfg.api_key.trim().is_empty() {
            return Err(ProviderError::Auth {
                details: None,
                code: None,
                message: "Missing Gemini API key (set gemini.api_key or GEMINI_API_KEY)".to_string(),
                status: None,
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Network {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: cfg.api_base.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_output_tokens: cfg.max_output_tokens,
            temperature: cfg.temperature,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model)
    }

    fn apply_headers(&self, mut rb: reqwest::RequestBuilder, req: &GenerateRequest) -> reqwest::RequestBuilder {
        rb = rb
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key);

        if let Some(meta) = &req.metadata {
            for (k, v) in meta {
                if k.eq_ignore_ascii_case("x-goog-api-key") || k.eq_ignore_ascii_case("content-type") {
                    continue;
                }
                rb = rb.header(k, v);
            }
        }
        rb
    }

    fn map_http_error(status: u16, body: &str) -> ProviderError {
        match serde_json::from_str::<JsonValue>(body) {
            Ok(v) => ProviderError::from_json(&v, Some(status)),
            Err(_) => ProviderError::from_json(
                &serde_json::json!({ "message": format!("Gemini returned HTTP {}", status) }),
                Some(status),
            ),
        }
    }

    fn parse_usage(v: &JsonValue) -> Option<Usage> {
        let meta = v.get("usageMetadata")?;
        let read = |k: &str| meta.get(k).and_then(|x| x.as_u64()).map(|x| x as u32);
        Some(Usage {
            prompt_tokens: read("promptTokenCount"),
            completion_tokens: read("candidatesTokenCount"),
            total_tokens: read("totalTokenCount"),
        })
    }

    /// Join the text parts of the first candidate
    fn extract_text(v: &JsonValue) -> Result<String, ProviderError> {
        let candidate = v
            .get("candidates")
            .and_then(|c| c.get(0))
            .ok_or_else(|| {
                let reason = v
                    .get("promptFeedback")
                    .and_then(|f| f.get("blockReason"))
                    .and_then(|r| r.as_str())
                    .unwrap_or("no candidates");
                ProviderError::InvalidResponse {
                    message: format!("Gemini returned no candidates ({})", reason),
                }
            })?;

        let text = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(text)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, mut req: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        if req.messages.is_empty() {
            return Err(ProviderError::invalid_params("Request has no messages", None));
        }
        req.temperature = req.temperature.or(self.temperature);
        req.max_output_tokens = req.max_output_tokens.or(self.max_output_tokens);

        let payload = map_internal_to_gemini(&req);
        debug!("Gemini request to model '{}'", self.model);

        let rb = self.apply_headers(self.client.post(self.endpoint()), &req);
        let resp = rb.json(&payload).send().await.map_err(|e| ProviderError::Network {
            message: format!("Gemini network error: {}", e),
        })?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| ProviderError::Network {
            message: format!("Failed reading Gemini response: {}", e),
        })?;

        if !(200..300).contains(&status) {
            return Err(Self::map_http_error(status, &body));
        }

        let v: JsonValue = serde_json::from_str(&body).map_err(|e| ProviderError::InvalidResponse {
            message: format!("Invalid JSON from Gemini: {}", e),
        })?;

        Ok(GenerateResponse {
            text: Self::extract_text(&v)?,
            usage: Self::parse_usage(&v),
            raw: Some(v),
        })
    }
}
