use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::openrouter::{default_http_client, join_endpoint};
use crate::utils::http::send_checked_json;
use crate::{RelayError, Result};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api-inference.modelscope.cn";

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const ASYNC_MODE_HEADER: &str = "X-ModelScope-Async-Mode";
const TASK_TYPE_HEADER: &str = "X-ModelScope-Task-Type";

/// ModelScope's image endpoint is asynchronous: submit a generation task,
/// then poll its status on a fixed cadence until a terminal state or the
/// caller's timeout budget runs out.
#[derive(Clone)]
pub struct ModelScopeImages {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
}

impl ModelScopeImages {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: default_http_client(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            poll_interval: POLL_INTERVAL,
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

    /// Shorten the wait between status checks. The attempt budget derives
    /// from the configured interval, so the default reproduces the fixed
    /// 5-second cadence.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Ceiling division, so a budget that is not a multiple of the cadence
    /// still gets its final partial attempt (121s -> 25 attempts).
    fn max_attempts(&self, timeout_secs: u64) -> u64 {
        timeout_secs.div_ceil(self.poll_interval.as_secs().max(1))
    }

    /// Submit a generation task and poll it to completion. Returns the
    /// first output image URL.
    pub async fn generate(
        &self,
        model: &str,
        parameters: &Map<String, Value>,
        timeout_secs: u64,
    ) -> Result<String> {
        let task_id = self.submit(model, parameters).await?;
        tracing::info!(%task_id, model, timeout_secs, "task submitted");
        self.poll(&task_id, timeout_secs).await
    }

    async fn submit(&self, model: &str, parameters: &Map<String, Value>) -> Result<String> {
        let response: SubmitResponse = send_checked_json(
            self.http
                .post(join_endpoint(&self.base_url, "v1/images/generations"))
                .bearer_auth(&self.api_key)
                .header(ASYNC_MODE_HEADER, "true")
                .json(&submit_payload(model, parameters)),
        )
        .await?;

        response
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                RelayError::InvalidResponse("ModelScope did not return a task id".to_string())
            })
    }

    async fn poll(&self, task_id: &str, timeout_secs: u64) -> Result<String> {
        let max_attempts = self.max_attempts(timeout_secs);
        for attempt in 1..=max_attempts {
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .http
                .get(join_endpoint(&self.base_url, &format!("v1/tasks/{task_id}")))
                .bearer_auth(&self.api_key)
                .header(TASK_TYPE_HEADER, "image_generation")
                .send()
                .await?;

            // A failed status check is transient; only submission failures
            // and terminal task states end the loop.
            if !response.status().is_success() {
                tracing::warn!(
                    %task_id,
                    attempt,
                    max_attempts,
                    status = %response.status(),
                    "task status check failed"
                );
                continue;
            }

            let status: TaskStatusResponse = response.json().await?;
            match status.task_status.as_str() {
                "SUCCEED" => {
                    return status.first_image_url().ok_or_else(|| {
                        RelayError::InvalidResponse(
                            "task succeeded but returned no images".to_string(),
                        )
                    });
                }
                "FAILED" => {
                    return Err(RelayError::TaskFailed(
                        status
                            .message
                            .filter(|message| !message.is_empty())
                            .unwrap_or_else(|| "unknown error".to_string()),
                    ));
                }
                state => {
                    tracing::debug!(%task_id, attempt, max_attempts, state, "task in progress");
                }
            }
        }

        Err(RelayError::Timeout {
            seconds: timeout_secs,
        })
    }
}

/// Parameter bag merged with the model id; caller parameters win on
/// collision, matching the upstream contract.
fn submit_payload(model: &str, parameters: &Map<String, Value>) -> Value {
    let mut payload = Map::new();
    payload.insert("model".to_string(), Value::String(model.to_string()));
    payload.extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
    Value::Object(payload)
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    #[serde(default)]
    task_status: String,
    #[serde(default)]
    output: Option<TaskOutput>,
    #[serde(default)]
    output_images: Option<Vec<String>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TaskOutput {
    #[serde(default)]
    images: Vec<TaskImage>,
}

#[derive(Debug, Deserialize)]
struct TaskImage {
    #[serde(default)]
    url: Option<String>,
}

impl TaskStatusResponse {
    /// Success payloads come in two shapes: nested `output.images[0].url`
    /// or flat `output_images[0]`. Empty strings count as absent.
    fn first_image_url(&self) -> Option<String> {
        if let Some(url) = self
            .output
            .as_ref()
            .and_then(|output| output.images.first())
            .and_then(|image| image.url.clone())
            .filter(|url| !url.is_empty())
        {
            return Some(url);
        }
        self.output_images
            .as_ref()
            .and_then(|images| images.first())
            .filter(|url| !url.is_empty())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, Method::POST, MockServer};
    use serde_json::json;

    fn params(prompt: &str) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("prompt".to_string(), Value::String(prompt.to_string()));
        out
    }

    fn fast_client(server: &MockServer) -> ModelScopeImages {
        ModelScopeImages::new("ms-key")
            .with_base_url(server.base_url())
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn attempt_budget_uses_ceiling_division() {
        let client = ModelScopeImages::new("k");
        assert_eq!(client.max_attempts(120), 24);
        assert_eq!(client.max_attempts(121), 25);
        assert_eq!(client.max_attempts(180), 36);
        assert_eq!(client.max_attempts(5), 1);
        assert_eq!(client.max_attempts(6), 2);
        assert_eq!(client.max_attempts(1), 1);
        assert_eq!(client.max_attempts(0), 0);
    }

    #[test]
    fn submit_payload_lets_parameters_override_model() {
        let payload = submit_payload("Qwen/Qwen-Image", &params("a red fox"));
        assert_eq!(payload["model"], "Qwen/Qwen-Image");
        assert_eq!(payload["prompt"], "a red fox");

        let mut overriding = params("a red fox");
        overriding.insert("model".to_string(), Value::String("other".to_string()));
        assert_eq!(submit_payload("Qwen/Qwen-Image", &overriding)["model"], "other");
    }

    #[test]
    fn first_image_url_checks_both_shapes_and_skips_empties() {
        let nested: TaskStatusResponse = serde_json::from_value(json!({
            "task_status": "SUCCEED",
            "output": { "images": [{ "url": "https://img.example/a.png" }] },
        }))
        .unwrap();
        assert_eq!(
            nested.first_image_url().as_deref(),
            Some("https://img.example/a.png")
        );

        let flat: TaskStatusResponse = serde_json::from_value(json!({
            "task_status": "SUCCEED",
            "output": { "images": [{ "url": "" }] },
            "output_images": ["https://img.example/b.png"],
        }))
        .unwrap();
        assert_eq!(
            flat.first_image_url().as_deref(),
            Some("https://img.example/b.png")
        );

        let empty: TaskStatusResponse = serde_json::from_value(json!({
            "task_status": "SUCCEED",
            "output_images": [""],
        }))
        .unwrap();
        assert_eq!(empty.first_image_url(), None);
    }

    #[tokio::test]
    async fn missing_task_id_fails_before_any_poll() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/images/generations")
                    .header("x-modelscope-async-mode", "true");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "request_id": "r-1" }).to_string());
            })
            .await;
        let status_mock = server
            .mock_async(|when, then| {
                when.method(GET).path_includes("/v1/tasks/");
                then.status(200).body("{}");
            })
            .await;

        let err = fast_client(&server)
            .generate("Qwen/Qwen-Image", &params("a red fox"), 60)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidResponse(_)));
        assert_eq!(status_mock.hits_async().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn polls_until_success_and_returns_nested_url() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/images/generations")
                    .body_includes("\"model\":\"Qwen/Qwen-Image\"")
                    .body_includes("\"prompt\":\"a red fox\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "task_id": "t-1" }).to_string());
            })
            .await;
        let status_mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/tasks/t-1")
                    .header("x-modelscope-task-type", "image_generation")
                    .header("authorization", "Bearer ms-key");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(
                        json!({
                            "task_status": "SUCCEED",
                            "output": { "images": [{ "url": "https://img.example/fox.png" }] },
                        })
                        .to_string(),
                    );
            })
            .await;

        let url = fast_client(&server)
            .generate("Qwen/Qwen-Image", &params("a red fox"), 60)
            .await?;
        assert_eq!(url, "https://img.example/fox.png");
        assert_eq!(status_mock.hits_async().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn flat_output_images_shape_is_accepted() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/images/generations");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "task_id": "t-2" }).to_string());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tasks/t-2");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(
                        json!({
                            "task_status": "SUCCEED",
                            "output_images": ["https://img.example/flat.png"],
                        })
                        .to_string(),
                    );
            })
            .await;

        let url = fast_client(&server)
            .generate("black-forest-labs/FLUX.1-dev", &params("a red fox"), 60)
            .await?;
        assert_eq!(url, "https://img.example/flat.png");
        Ok(())
    }

    #[tokio::test]
    async fn succeeded_task_without_images_fails_immediately() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/images/generations");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "task_id": "t-3" }).to_string());
            })
            .await;
        let status_mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tasks/t-3");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "task_status": "SUCCEED" }).to_string());
            })
            .await;

        let err = fast_client(&server)
            .generate("Qwen/Qwen-Image", &params("a red fox"), 60)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidResponse(_)));
        // Terminal despite the generous budget.
        assert_eq!(status_mock.hits_async().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_task_surfaces_the_provider_message() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/images/generations");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "task_id": "t-4" }).to_string());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tasks/t-4");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(
                        json!({ "task_status": "FAILED", "message": "content rejected" })
                            .to_string(),
                    );
            })
            .await;

        let err = fast_client(&server)
            .generate("Qwen/Qwen-Image", &params("a red fox"), 60)
            .await
            .unwrap_err();
        match err {
            RelayError::TaskFailed(message) => assert_eq!(message, "content rejected"),
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn transient_status_failures_do_not_abort_the_loop() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/images/generations");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "task_id": "t-5" }).to_string());
            })
            .await;
        let failing = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tasks/t-5");
                then.status(502).body("bad gateway");
            })
            .await;

        let client = fast_client(&server);
        let handle =
            tokio::spawn(async move { client.generate("Qwen/Qwen-Image", &params("a red fox"), 600).await });

        // Let at least one status check fail, then swap in a success.
        while failing.hits_async().await < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        failing.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tasks/t-5");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(
                        json!({
                            "task_status": "SUCCEED",
                            "output": { "images": [{ "url": "https://img.example/late.png" }] },
                        })
                        .to_string(),
                    );
            })
            .await;

        let url = handle.await.expect("generate task panicked")?;
        assert_eq!(url, "https://img.example/late.png");
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_attempts_yield_a_timeout_naming_the_budget() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/images/generations");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "task_id": "t-6" }).to_string());
            })
            .await;
        let status_mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/tasks/t-6");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "task_status": "PENDING" }).to_string());
            })
            .await;

        // 10ms interval rounds up to a 1-second divisor: 3 attempts.
        let err = fast_client(&server)
            .generate("Qwen/Qwen-Image", &params("a red fox"), 3)
            .await
            .unwrap_err();
        match &err {
            RelayError::Timeout { seconds } => assert_eq!(*seconds, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains('3'));
        assert_eq!(status_mock.hits_async().await, 3);
        Ok(())
    }
}
