use std::time::Duration;

use serde_json::{Map, Value};

use crate::env::Env;
use crate::providers::{ModelScopeImages, OpenRouterChat, modelscope, openrouter};
use crate::types::{GenerateRequest, Generation};
use crate::{RelayError, Result};

pub const QWEN_DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_TIMEOUT_SECS: u64 = 180;

/// A request's model id selects exactly one adapter. Anything that is not a
/// known conversational id is a ModelScope model and keeps its own name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelTarget {
    NanoBanana,
    ChatGpt,
    ModelScope(String),
}

impl ModelTarget {
    pub fn parse(model: &str) -> Self {
        match model {
            "nanobanana" => ModelTarget::NanoBanana,
            "chatgpt" => ModelTarget::ChatGpt,
            other => ModelTarget::ModelScope(other.to_string()),
        }
    }

    pub fn key_env_var(&self) -> &'static str {
        match self {
            ModelTarget::NanoBanana => "OPENROUTER_API_KEY",
            ModelTarget::ChatGpt => "OPENAI_API_KEY",
            ModelTarget::ModelScope(_) => "MODELSCOPE_API_KEY",
        }
    }

    pub fn missing_key_message(&self) -> &'static str {
        match self {
            ModelTarget::NanoBanana => "OpenRouter API key is not set.",
            ModelTarget::ChatGpt => "OpenAI API key is not set.",
            ModelTarget::ModelScope(_) => "ModelScope API key is not set.",
        }
    }
}

/// Poll budget when the caller omits one. Client UIs rely on these values
/// implicitly, so they are part of the contract.
pub fn default_timeout_secs(model: &str) -> u64 {
    if model.contains("Qwen") {
        QWEN_DEFAULT_TIMEOUT_SECS
    } else {
        DEFAULT_TIMEOUT_SECS
    }
}

/// Routes normalized generation requests to the matching provider adapter.
/// Holds only process-wide configuration; per-request state (the resolved
/// credential, the parameter bag) is passed explicitly into each adapter.
#[derive(Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    env: Env,
    openrouter_base_url: String,
    modelscope_base_url: String,
    poll_interval: Option<Duration>,
}

impl Dispatcher {
    pub fn new(env: Env) -> Self {
        Self {
            http: openrouter::default_http_client(),
            env,
            openrouter_base_url: openrouter::DEFAULT_BASE_URL.to_string(),
            modelscope_base_url: modelscope::DEFAULT_BASE_URL.to_string(),
            poll_interval: None,
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_openrouter_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.openrouter_base_url = base_url.into();
        self
    }

    pub fn with_modelscope_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.modelscope_base_url = base_url.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Client-supplied key first, then the provider's server-side fallback.
    /// Client keys are never validated locally.
    pub fn resolve_api_key(
        &self,
        target: &ModelTarget,
        client_key: Option<&str>,
    ) -> Result<String> {
        client_key
            .map(str::to_string)
            .or_else(|| self.env.get(target.key_env_var()))
            .ok_or_else(|| RelayError::MissingApiKey(target.missing_key_message().to_string()))
    }

    pub fn openrouter_chat(&self, api_key: impl Into<String>) -> OpenRouterChat {
        OpenRouterChat::new(api_key)
            .with_http_client(self.http.clone())
            .with_base_url(self.openrouter_base_url.as_str())
    }

    pub async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        let target = ModelTarget::parse(&request.model);
        let api_key = self.resolve_api_key(&target, request.client_api_key())?;
        match &target {
            ModelTarget::NanoBanana => {
                self.generate_conversational(openrouter::GEMINI_IMAGE_MODEL, &api_key, request)
                    .await
            }
            ModelTarget::ChatGpt => {
                self.generate_conversational(openrouter::GPT_IMAGE_MODEL, &api_key, request)
                    .await
            }
            ModelTarget::ModelScope(model) => {
                self.generate_modelscope(model, &api_key, request).await
            }
        }
    }

    async fn generate_conversational(
        &self,
        model: &str,
        api_key: &str,
        request: &GenerateRequest,
    ) -> Result<Generation> {
        let prompt = request
            .prompt
            .as_deref()
            .filter(|prompt| !prompt.is_empty())
            .ok_or_else(|| RelayError::Validation("Prompt is required.".to_string()))?;
        self.openrouter_chat(api_key)
            .with_model(model)
            .generate_image(prompt, &request.images)
            .await
    }

    async fn generate_modelscope(
        &self,
        model: &str,
        api_key: &str,
        request: &GenerateRequest,
    ) -> Result<Generation> {
        let parameters = request
            .parameters
            .as_ref()
            .filter(|parameters| has_prompt(parameters))
            .ok_or_else(|| {
                RelayError::Validation(
                    "Positive prompt is required for ModelScope models.".to_string(),
                )
            })?;
        let timeout_secs = request
            .timeout_secs()
            .unwrap_or_else(|| default_timeout_secs(model));

        let mut client = ModelScopeImages::new(api_key)
            .with_http_client(self.http.clone())
            .with_base_url(self.modelscope_base_url.as_str());
        if let Some(poll_interval) = self.poll_interval {
            client = client.with_poll_interval(poll_interval);
        }

        let url = client.generate(model, parameters, timeout_secs).await?;
        Ok(Generation::Image { url })
    }
}

fn has_prompt(parameters: &Map<String, Value>) -> bool {
    parameters
        .get("prompt")
        .and_then(Value::as_str)
        .is_some_and(|prompt| !prompt.is_empty())
}
