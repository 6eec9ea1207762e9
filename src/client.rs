use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::config::Config;
use crate::core::error::{GatewayError, ProviderError};
use crate::gateway::Gateway;
use crate::providers::gemini::GeminiProvider;
use crate::providers::{GenerateRequest, GenerateResponse, Provider};

/// A provider bound to a gateway: every request is queued, coalesced and
/// retried on rate limits.
#[derive(Clone)]
pub struct GeminiClient {
    provider: Arc<dyn Provider>,
    gateway: Arc<Gateway<GenerateResponse>>,
}

impl GeminiClient {
    pub fn new(provider: Arc<dyn Provider>, gateway: Arc<Gateway<GenerateResponse>>) -> Self {
        Self { provider, gateway }
    }

    /// Build a Gemini provider and a dedicated gateway from configuration
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let provider = GeminiProvider::from_config(&config.gemini)?;
        Ok(Self::new(
            Arc::new(provider),
            Arc::new(Gateway::new(&config.gateway)),
        ))
    }

    /// Bind a provider to the process-wide gateway
    pub fn with_global_gateway(provider: Arc<dyn Provider>) -> Self {
        Self::new(provider, Gateway::global())
    }

    pub fn gateway(&self) -> &Arc<Gateway<GenerateResponse>> {
        &self.gateway
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Single-prompt generation
    pub async fn generate(&self, prompt: &str, label: &str) -> Result<GenerateResponse, GatewayError> {
        self.generate_request(GenerateRequest::from_prompt(prompt), label)
            .await
    }

    pub async fn generate_request(&self, req: GenerateRequest, label: &str) -> Result<GenerateResponse, GatewayError> {
        self.generate_request_with_cancel(req, label, &CancellationToken::new())
            .await
    }

    pub async fn generate_request_with_cancel(
        &self,
        req: GenerateRequest,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, GatewayError> {
        let prompt = req.prompt_text().to_string();
        let model = self.provider.model().to_string();
        let provider = Arc::clone(&self.provider);

        let operation = move || {
            let provider = Arc::clone(&provider);
            let req = req.clone();
            async move { provider.generate(req).await }
        };

        self.gateway
            .call_with_cancel(operation, &prompt, &model, label, cancel)
            .await
    }
}
