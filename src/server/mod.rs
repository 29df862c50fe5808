use std::path::PathBuf;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::RelayError;
use crate::dispatch::{Dispatcher, ModelTarget};
use crate::env::Env;
use crate::optimize::{DEFAULT_ROLE_FILE, PromptOptimizer};
use crate::types::{
    DownloadProxyRequest, ErrorResponse, GenerateRequest, GenerateResponse, Generation,
    KeyStatusResponse, PromptOptimizeRequest, PromptOptimizeResponse,
};
use crate::utils::http::send_checked;

pub const DEFAULT_STATIC_DIR: &str = "static";

#[derive(Clone)]
pub struct RelayState {
    dispatcher: Dispatcher,
    role_file: PathBuf,
    static_dir: PathBuf,
}

impl RelayState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            role_file: PathBuf::from(DEFAULT_ROLE_FILE),
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
        }
    }

    pub fn with_role_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.role_file = path.into();
        self
    }

    pub fn with_static_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.static_dir = path.into();
        self
    }

    fn env(&self) -> &Env {
        self.dispatcher.env()
    }
}

/// The full HTTP surface: key-presence checks, generation, prompt
/// optimization, the download proxy, and a static-file fallback for the
/// browser UI. The CORS layer answers OPTIONS preflights permissively.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/api/key-status", get(openrouter_key_status))
        .route("/api/openai-key-status", get(openai_key_status))
        .route("/api/modelscope-key-status", get(modelscope_key_status))
        .route("/generate", post(generate))
        .route("/prompt-optimize", post(prompt_optimize))
        .route("/download-proxy", post(download_proxy))
        .fallback_service(ServeDir::new(state.static_dir.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn openrouter_key_status(State(state): State<RelayState>) -> Json<KeyStatusResponse> {
    key_status(&state, "OPENROUTER_API_KEY")
}

async fn openai_key_status(State(state): State<RelayState>) -> Json<KeyStatusResponse> {
    key_status(&state, "OPENAI_API_KEY")
}

async fn modelscope_key_status(State(state): State<RelayState>) -> Json<KeyStatusResponse> {
    key_status(&state, "MODELSCOPE_API_KEY")
}

fn key_status(state: &RelayState, var: &str) -> Json<KeyStatusResponse> {
    Json(KeyStatusResponse {
        is_set: state.env().is_set(var),
    })
}

async fn generate(
    State(state): State<RelayState>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    let target = ModelTarget::parse(&request.model);
    match state.dispatcher.generate(&request).await {
        Ok(Generation::Image { url }) => Json(GenerateResponse { image_url: url }).into_response(),
        Ok(Generation::Text { content }) => json_error(
            StatusCode::BAD_REQUEST,
            format!("Model returned text instead of an image: \"{content}\""),
        ),
        Err(err) => {
            tracing::error!(model = %request.model, %err, "generation failed");
            json_error(generate_error_status(&target, &err), err.to_string())
        }
    }
}

/// Validation stays 400 and a missing ModelScope key is 401; every other
/// failure, missing conversational keys included, is a plain 500. Client
/// UIs key off these statuses.
fn generate_error_status(target: &ModelTarget, err: &RelayError) -> StatusCode {
    match err {
        RelayError::Validation(_) => StatusCode::BAD_REQUEST,
        RelayError::MissingApiKey(_) => match target {
            ModelTarget::ModelScope(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn prompt_optimize(
    State(state): State<RelayState>,
    Json(request): Json<PromptOptimizeRequest>,
) -> Response {
    let (Some(prompt), Some(target_model)) = (
        non_empty(request.prompt),
        non_empty(request.target_model),
    ) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Prompt and targetModel are required.",
        );
    };
    let Some(api_key) = non_empty(request.api_key)
        .or_else(|| state.env().get("OPENROUTER_API_KEY"))
    else {
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "OpenRouter API key is not set.",
        );
    };

    let optimizer = PromptOptimizer::new(state.dispatcher.openrouter_chat(api_key))
        .with_role_file(state.role_file.clone());
    match optimizer.optimize(&prompt, &target_model).await {
        Ok(optimized_prompt) => Json(PromptOptimizeResponse {
            success: true,
            optimized_prompt,
        })
        .into_response(),
        Err(err) => {
            tracing::error!(%err, "prompt optimization failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn download_proxy(
    State(state): State<RelayState>,
    Json(request): Json<DownloadProxyRequest>,
) -> Response {
    let Some(image_url) = non_empty(request.image_url) else {
        return json_error(StatusCode::BAD_REQUEST, "imageUrl is required.");
    };

    let upstream = match send_checked(state.dispatcher.http().get(&image_url)).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(%image_url, %err, "download proxy fetch failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let filename = attachment_filename(&image_url);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Last path segment of the URL when it looks like a safe filename,
/// otherwise a generic default.
fn attachment_filename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or("");
    let safe = !name.is_empty()
        && name.contains('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if safe {
        name.to_string()
    } else {
        "image.png".to_string()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_filename_keeps_safe_names_only() {
        assert_eq!(
            attachment_filename("https://img.example/out/fox-01.png?sig=abc"),
            "fox-01.png"
        );
        assert_eq!(attachment_filename("https://img.example/fox"), "image.png");
        assert_eq!(
            attachment_filename("https://img.example/%22quoted%22.png"),
            "image.png"
        );
        assert_eq!(attachment_filename("https://img.example/"), "image.png");
    }

    #[test]
    fn error_status_mapping_matches_the_wire_contract() {
        let qwen = ModelTarget::parse("Qwen/Qwen-Image");
        let banana = ModelTarget::parse("nanobanana");
        let missing = RelayError::MissingApiKey("x".to_string());
        let invalid = RelayError::Validation("x".to_string());
        let timeout = RelayError::Timeout { seconds: 120 };

        assert_eq!(
            generate_error_status(&qwen, &missing),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            generate_error_status(&banana, &missing),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            generate_error_status(&banana, &invalid),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            generate_error_status(&qwen, &timeout),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
