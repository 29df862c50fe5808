use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::types::Generation;
use crate::utils::http::send_checked_json;
use crate::{RelayError, Result};

pub(crate) const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Upstream model id behind the `nanobanana` target.
pub const GEMINI_IMAGE_MODEL: &str = "google/gemini-2.5-flash-image-preview";
/// Upstream model id behind the `chatgpt` target.
pub const GPT_IMAGE_MODEL: &str = "openai/gpt-5-image-mini";

const NO_CONTENT_SENTINEL: &str = "[model returned no usable content]";
const DATA_URL_PREFIX: &str = "data:image/";
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

pub(crate) fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) fn join_endpoint(base_url: &str, endpoint: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    format!("{base}/{endpoint}")
}

/// Chat-completions client for OpenRouter-hosted models. Covers the two
/// conversational image models and the text model the prompt optimizer
/// calls; exactly one attempt per call, no retry.
#[derive(Clone)]
pub struct OpenRouterChat {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenRouterChat {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: default_http_client(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: GEMINI_IMAGE_MODEL.to_string(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn ensure_api_key(&self) -> Result<&str> {
        let key = self.api_key.trim();
        if key.is_empty() {
            return Err(RelayError::MissingApiKey(
                "OpenRouter call attempted with an empty API key.".to_string(),
            ));
        }
        Ok(key)
    }

    fn chat_completions_url(&self) -> String {
        join_endpoint(&self.base_url, "chat/completions")
    }

    /// Submit one multimodal user message (text part first, then one
    /// `image_url` part per reference image, order preserved) and classify
    /// the answer as an image or prose.
    pub async fn generate_image(&self, prompt: &str, images: &[String]) -> Result<Generation> {
        let api_key = self.ensure_api_key()?;

        let mut parts = vec![json!({ "type": "text", "text": prompt })];
        parts.extend(
            images
                .iter()
                .map(|url| json!({ "type": "image_url", "image_url": { "url": url } })),
        );
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": parts }],
        });

        tracing::debug!(model = %self.model, images = images.len(), "submitting chat completion");
        let response: ChatCompletionResponse = send_checked_json(
            self.http
                .post(self.chat_completions_url())
                .bearer_auth(api_key)
                .json(&payload),
        )
        .await?;

        Ok(classify_message(response.into_message()))
    }

    /// Plain text completion (system + user), used for prompt rewriting.
    /// Returns the trimmed assistant text, empty when the model sent none.
    pub async fn complete_text(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<String> {
        let api_key = self.ensure_api_key()?;

        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let response: ChatCompletionResponse = send_checked_json(
            self.http
                .post(self.chat_completions_url())
                .bearer_auth(api_key)
                .json(&payload),
        )
        .await?;

        Ok(response
            .into_message()
            .as_ref()
            .and_then(ChatMessage::text)
            .map(|text| text.trim().to_string())
            .unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

impl ChatCompletionResponse {
    fn into_message(self) -> Option<ChatMessage> {
        self.choices.into_iter().next().and_then(|c| c.message)
    }
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    images: Vec<ChatImagePart>,
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatImagePart {
    #[serde(default)]
    image_url: Option<ChatImageUrl>,
}

#[derive(Debug, Deserialize)]
struct ChatImageUrl {
    url: String,
}

impl ChatMessage {
    fn image_url(&self) -> Option<&str> {
        self.images
            .first()
            .and_then(|part| part.image_url.as_ref())
            .map(|image| image.url.as_str())
    }

    fn text(&self) -> Option<&str> {
        self.content.as_ref().and_then(Value::as_str)
    }
}

/// Four-way classification of a chat answer, nested image reference first,
/// then an inlined data URL, then any non-empty prose, then the sentinel.
fn classify_message(message: Option<ChatMessage>) -> Generation {
    let Some(message) = message else {
        return Generation::Text {
            content: NO_CONTENT_SENTINEL.to_string(),
        };
    };
    if let Some(url) = message.image_url() {
        return Generation::Image {
            url: url.to_string(),
        };
    }
    match message.text() {
        Some(content) if content.starts_with(DATA_URL_PREFIX) => Generation::Image {
            url: content.to_string(),
        },
        Some(content) if !content.trim().is_empty() => Generation::Text {
            content: content.to_string(),
        },
        _ => Generation::Text {
            content: NO_CONTENT_SENTINEL.to_string(),
        },
    }
}
