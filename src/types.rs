use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of `POST /generate`. Field names are the browser wire contract;
/// `apikey` is lowercase there while `/prompt-optimize` uses `apiKey`.
#[derive(Clone, Debug, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default)]
    pub apikey: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl GenerateRequest {
    /// Caller-supplied poll budget in seconds. Zero means "not set", like
    /// every other absent field on this loosely-typed surface.
    pub fn timeout_secs(&self) -> Option<u64> {
        self.timeout.filter(|secs| *secs > 0)
    }

    pub fn client_api_key(&self) -> Option<&str> {
        self.apikey
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Uniform adapter outcome. Conversational models may legitimately answer
/// with prose instead of an image; the HTTP layer decides what that means.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Generation {
    Image { url: String },
    Text { content: String },
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    #[serde(rename = "imageUrl")]
    pub image_url: String,
}

#[derive(Debug, Deserialize)]
pub struct PromptOptimizeRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(rename = "targetModel", default)]
    pub target_model: Option<String>,
    #[serde(rename = "apiKey", default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PromptOptimizeResponse {
    pub success: bool,
    #[serde(rename = "optimizedPrompt")]
    pub optimized_prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadProxyRequest {
    #[serde(rename = "imageUrl", default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct KeyStatusResponse {
    #[serde(rename = "isSet")]
    pub is_set: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
