use crate::config::IamConfig;
use crate::errors::{AuthError, SandboxError, SandboxResult};
use crate::models::UserIdentity;
use crate::service::IdentityProvider;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for the IAM service.
#[derive(Clone, Debug)]
pub struct IamClient {
    client: Client,
    base_url: String,
    service_token: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    password: &'a str,
}

#[derive(Serialize)]
struct IssueTokenRequest<'a> {
    duration: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: String,
}

impl IamClient {
    pub fn new(config: &IamConfig) -> SandboxResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.allow_insecure)
            .build()
            .map_err(|e| SandboxError::Identity(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_token: config.token.clone(),
        })
    }

    fn user_url(&self, username: &str, suffix: &str) -> String {
        format!("{}/users/{}{suffix}", self.base_url, username)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        if self.service_token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.service_token)
        }
    }
}

/// Decodes a successful body, or turns IAM's `{"message"}` errors into
/// errors carrying that message.
async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> SandboxResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| SandboxError::Identity(format!("malformed IAM response: {e}")));
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.message)
        .unwrap_or_else(|_| format!("{status}: {}", text.trim()));
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            AuthError::Provider(message).into()
        }
        _ => SandboxError::Identity(message),
    })
}

fn transport_error(error: reqwest::Error) -> SandboxError {
    SandboxError::Identity(format!("IAM request failed: {error}"))
}

#[async_trait]
impl IdentityProvider for IamClient {
    async fn login(&self, username: &str, password: &str) -> SandboxResult<String> {
        let response = self
            .client
            .post(self.user_url(username, "/login"))
            .json(&LoginRequest { password })
            .send()
            .await
            .map_err(transport_error)?;
        match parse_response::<TokenResponse>(response).await {
            Ok(body) => Ok(body.token),
            Err(SandboxError::Auth(AuthError::Provider(message))) => {
                Err(AuthError::InvalidCredentials(message).into())
            }
            Err(other) => Err(other),
        }
    }

    async fn get_user(&self, username: &str) -> SandboxResult<UserIdentity> {
        let response = self
            .authorized(self.client.get(self.user_url(username, "")))
            .send()
            .await
            .map_err(transport_error)?;
        parse_response(response).await
    }

    async fn issue_token(&self, username: &str, duration: &str) -> SandboxResult<String> {
        let response = self
            .authorized(self.client.post(self.user_url(username, "/token")))
            .json(&IssueTokenRequest { duration })
            .send()
            .await
            .map_err(transport_error)?;
        let body: TokenResponse = parse_response(response).await?;
        Ok(body.token)
    }
}
