//! HTTP client for the control plane worker API.

use std::time::Duration;

use reqwest::StatusCode;

use fleet_common::{RunnerState, RunnerTaskResponse, Session, SessionFilter};

use crate::config::ApiConfig;
use crate::error::{Result, RunnerError};

/// Talks to the control plane: session polling, heartbeats and task
/// response uploads.
pub struct ControlPlaneClient {
    base_url: String,
    token: String,
    runner_id: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(api: &ApiConfig, runner_id: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()
            .map_err(|e| RunnerError::Api(e.to_string()))?;
        Ok(Self {
            base_url: api.host.trim_end_matches('/').to_string(),
            token: api.token.clone(),
            runner_id,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    /// Ask the scheduler for a session matching the filter. 204 means
    /// nothing matched.
    pub async fn poll_session(&self, filter: &SessionFilter) -> Result<Option<Session>> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/worker/session?runner_id={}", self.runner_id),
            )
            .json(filter)
            .send()
            .await
            .map_err(|e| RunnerError::Api(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let session = response
                    .json()
                    .await
                    .map_err(|e| RunnerError::Api(e.to_string()))?;
                Ok(Some(session))
            }
            status => Err(RunnerError::Api(format!("poll returned {}", status))),
        }
    }

    /// Report runner state.
    pub async fn post_state(&self, state: &RunnerState) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/api/v1/worker/state")
            .json(state)
            .send()
            .await
            .map_err(|e| RunnerError::Api(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RunnerError::Api(format!(
                "state report returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Forward a task response to the control plane.
    pub async fn post_response(
        &self,
        instance_id: &str,
        response: &RunnerTaskResponse,
    ) -> Result<()> {
        let http_response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/worker/response/{}", instance_id),
            )
            .json(response)
            .send()
            .await
            .map_err(|e| RunnerError::Api(e.to_string()))?;
        if !http_response.status().is_success() {
            return Err(RunnerError::Api(format!(
                "response upload returned {}",
                http_response.status()
            )));
        }
        Ok(())
    }
}
