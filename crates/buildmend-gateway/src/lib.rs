//! HTTP client for the analysis and fix service.
//!
//! Implements [`AnalysisGateway`] over three bearer-authenticated JSON
//! endpoints:
//!
//! - `POST {base}/analyze` - analyse one file's content
//! - `POST {base}/fix` - request corrections for reported issues
//! - `POST {base}/analyze/build-error` - map build error lines to file fixes
//!
//! Transport failures, non-2xx statuses and payloads carrying an `error`
//! field map to [`GatewayError::ServiceUnavailable`]; a 2xx body that does not
//! decode maps to [`GatewayError::InvalidResponse`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use buildmend_core::config::BuildmendConfig;
use buildmend_core::gateway::{
    detect_language, AnalysisGateway, AnalysisResult, BuildErrorAnalysis, GatewayError,
    GatewayResult, Issue,
};
use buildmend_core::Correction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest response excerpt quoted in an error message.
const MAX_ERROR_BODY: usize = 200;

/// Connection settings for [`HttpGateway`].
#[derive(Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    /// Sent with build-error analysis requests (e.g. `ios`).
    pub project_type: String,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("project_type", &self.project_type)
            .finish()
    }
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(300),
            project_type: "ios".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take the `service` section of the effective configuration.
    pub fn from_config(config: &BuildmendConfig) -> Self {
        Self {
            base_url: config.service.base_url.clone(),
            api_key: config.service.api_key.clone(),
            timeout: config.service_timeout(),
            project_type: config.service.project_type.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    file_path: String,
    content: &'a str,
    language: &'static str,
    analysis_type: &'static str,
}

#[derive(Serialize)]
struct FixRequest<'a> {
    file_path: String,
    issues: &'a [Issue],
    auto_fix: bool,
}

#[derive(Deserialize)]
struct FixResponse {
    #[serde(default)]
    corrections: Vec<Correction>,
}

#[derive(Serialize)]
struct BuildErrorRequest<'a> {
    error_log: String,
    error_lines: &'a [String],
    project_type: &'a str,
    suggest_fixes: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`AnalysisGateway`] backed by `reqwest`.
#[derive(Debug)]
pub struct HttpGateway {
    config: GatewayConfig,
    http_client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(format!("buildmend/{}", buildmend_core::VERSION))
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::ServiceUnavailable(format!("cannot build HTTP client: {e}")))?;

        Ok(HttpGateway {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    async fn post<B, T>(&self, endpoint: &str, body: &B) -> GatewayResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(endpoint);
        debug!(url = %url, "calling analysis service");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::ServiceUnavailable(format!("{endpoint}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::ServiceUnavailable(format!("{endpoint}: {e}")))?;

        if !status.is_success() {
            return Err(GatewayError::ServiceUnavailable(format!(
                "{endpoint}: HTTP {status}: {}",
                excerpt(&text)
            )));
        }

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::InvalidResponse(format!("{endpoint}: {e}")))?;
        if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
            let message = err
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(GatewayError::ServiceUnavailable(format!("{endpoint}: {message}")));
        }

        serde_json::from_value(value)
            .map_err(|e| GatewayError::InvalidResponse(format!("{endpoint}: {e}")))
    }
}

fn excerpt(text: &str) -> &str {
    let text = text.trim();
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl AnalysisGateway for HttpGateway {
    async fn analyze_file(&self, path: &Path, content: &str) -> GatewayResult<AnalysisResult> {
        let request = AnalyzeRequest {
            file_path: path.display().to_string(),
            content,
            language: detect_language(path),
            analysis_type: "full",
        };
        self.post("analyze", &request).await
    }

    async fn request_fixes(&self, path: &Path, issues: &[Issue]) -> GatewayResult<Vec<Correction>> {
        let request = FixRequest {
            file_path: path.display().to_string(),
            issues,
            auto_fix: true,
        };
        let response: FixResponse = self.post("fix", &request).await?;
        Ok(response.corrections)
    }

    async fn analyze_build_errors(
        &self,
        error_lines: &[String],
    ) -> GatewayResult<BuildErrorAnalysis> {
        let request = BuildErrorRequest {
            error_log: error_lines.join("\n"),
            error_lines,
            project_type: &self.config.project_type,
            suggest_fixes: true,
        };
        self.post("analyze/build-error", &request).await
    }
}
