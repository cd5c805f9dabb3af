use crate::error::Result;
use crate::model::{ErrorKind, FailureDetails, Job, SelectorMap};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationOutput {
    pub images: Vec<String>,
    #[serde(default)]
    pub provider_response: Option<String>,
}

/// A failed generation attempt, typed by what went wrong.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AutomationFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub details: FailureDetails,
}

impl AutomationFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            details: FailureDetails::message(message.clone()),
            message,
        }
    }

    pub fn element_not_found(element: impl Into<String>) -> Self {
        let element = element.into();
        Self {
            kind: ErrorKind::ElementNotFound,
            message: format!("Element not found: {}", element),
            details: FailureDetails::missing(element),
        }
    }

    pub fn with_snapshot(mut self, html: impl Into<String>) -> Self {
        self.details.page_snapshot = Some(html.into());
        self
    }
}

/// Drives one provider's UI to turn a prompt into images.
#[async_trait]
pub trait Automation: Send + Sync {
    async fn run(
        &self,
        job: &Job,
        selectors: &SelectorMap,
    ) -> std::result::Result<AutomationOutput, AutomationFailure>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    job_id: &'a str,
    provider: &'a str,
    prompt: &'a str,
    selectors: &'a SelectorMap,
}

#[derive(Debug, Default, Deserialize)]
struct FailureBody {
    error_kind: Option<ErrorKind>,
    #[serde(default)]
    missing_element: Option<String>,
    #[serde(default)]
    page_snapshot: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Hands jobs to an external browser-automation runner over HTTP.
pub struct HttpAutomation {
    client: Client,
    endpoint: Url,
}

impl HttpAutomation {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("genqueue/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint })
    }

    fn generate_url(&self) -> Result<Url> {
        let mut base = self.endpoint.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join("generate")
            .map_err(|e| crate::Error::Config(format!("invalid automation endpoint: {}", e)))
    }
}

fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        429 => ErrorKind::RateLimit,
        402 => ErrorKind::QuotaExceeded,
        503 => ErrorKind::Maintenance,
        500..=599 => ErrorKind::ServerError,
        400..=499 => ErrorKind::Configuration,
        _ => ErrorKind::Unknown,
    }
}

fn transport_failure(e: reqwest::Error) -> AutomationFailure {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_connect() {
        ErrorKind::ServerError
    } else {
        ErrorKind::Unknown
    };
    AutomationFailure::new(kind, e.to_string())
}

/// A body naming an `error_kind` wins over whatever the status code says.
fn failure_from_body(body: &str) -> Option<AutomationFailure> {
    let parsed: FailureBody = serde_json::from_str(body).ok()?;
    let kind = parsed.error_kind?;
    let message = parsed
        .message
        .clone()
        .or_else(|| parsed.missing_element.as_ref().map(|m| format!("Element not found: {}", m)))
        .unwrap_or_else(|| kind.to_string());
    Some(AutomationFailure {
        kind,
        message,
        details: FailureDetails {
            missing_element: parsed.missing_element,
            page_snapshot: parsed.page_snapshot,
            message: parsed.message,
        },
    })
}

#[async_trait]
impl Automation for HttpAutomation {
    async fn run(
        &self,
        job: &Job,
        selectors: &SelectorMap,
    ) -> std::result::Result<AutomationOutput, AutomationFailure> {
        let url = self
            .generate_url()
            .map_err(|e| AutomationFailure::new(ErrorKind::Configuration, e.to_string()))?;
        log::info!("Submitting job {} to {}", job.id, url);

        let request = GenerateRequest {
            job_id: &job.id,
            provider: &job.provider,
            prompt: &job.prompt,
            selectors,
        };
        let res = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(transport_failure)?;
        let status = res.status();
        let body = res.text().await.map_err(transport_failure)?;
        log::debug!("Automation runner answered {} ({} bytes)", status, body.len());

        if let Some(failure) = failure_from_body(&body) {
            return Err(failure);
        }
        if !status.is_success() {
            return Err(AutomationFailure::new(
                kind_for_status(status),
                format!("HTTP error: {}", status),
            ));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| {
            AutomationFailure::new(ErrorKind::Unknown, format!("unreadable runner response: {}", e))
        })?;
        serde_json::from_value(value).map_err(|e| {
            AutomationFailure::new(ErrorKind::Unknown, format!("unexpected runner response: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job() -> Job {
        Job::new("a lighthouse at dusk", "ImageFX", 3, Utc::now())
    }

    fn automation(server: &MockServer) -> HttpAutomation {
        let endpoint = Url::parse(&server.uri()).unwrap();
        HttpAutomation::new(endpoint, Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn posts_prompt_and_selectors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .and(body_partial_json(json!({
                "provider": "ImageFX",
                "prompt": "a lighthouse at dusk",
                "selectors": {"prompt_input": "#prompt"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "images": ["https://cdn.example.com/1.png"],
                "provider_response": "Success"
            })))
            .mount(&server)
            .await;

        let mut selectors = SelectorMap::new();
        selectors.insert("prompt_input".into(), "#prompt".into());
        let output = automation(&server).run(&job(), &selectors).await.unwrap();
        assert_eq!(output.images, vec!["https://cdn.example.com/1.png"]);
        assert_eq!(output.provider_response.as_deref(), Some("Success"));
    }

    #[tokio::test]
    async fn status_codes_map_to_error_kinds() {
        let cases = [
            (429, ErrorKind::RateLimit),
            (402, ErrorKind::QuotaExceeded),
            (503, ErrorKind::Maintenance),
            (502, ErrorKind::ServerError),
        ];
        for (status, kind) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
            let failure = automation(&server)
                .run(&job(), &SelectorMap::new())
                .await
                .unwrap_err();
            assert_eq!(failure.kind, kind, "status {}", status);
        }
    }

    #[tokio::test]
    async fn error_body_takes_precedence_over_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error_kind": "element_not_found",
                "missing_element": "generate_button",
                "page_snapshot": "<button class='generate-btn'>Go</button>"
            })))
            .mount(&server)
            .await;

        let failure = automation(&server)
            .run(&job(), &SelectorMap::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::ElementNotFound);
        assert_eq!(failure.details.missing_element.as_deref(), Some("generate_button"));
        assert!(failure.details.page_snapshot.is_some());
        assert_eq!(failure.message, "Element not found: generate_button");
    }

    #[tokio::test]
    async fn slow_runner_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"images": []}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let failure = automation(&server)
            .run(&job(), &SelectorMap::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Timeout);
    }
}
