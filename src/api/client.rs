//! HTTP transport for the admin API.
//!
//! Every authenticated request goes through `send_authorized`, which attaches
//! the bearer token and, on a 401, refreshes the access token once and
//! retries. A failed refresh surfaces as `DashboardError::LoginRequired`.

use super::models::{SignUpRequest, SignUpResponse, TokenPair, VerifyEmailRequest};
use crate::config::ApiConfig;
use crate::error::{DashboardError, Result};
use crate::session::SessionStore;
use log::{debug, info, warn};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Admin API client bound to an operator session.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<SessionStore>,
    /// Serializes token refreshes so concurrent 401s refresh once.
    refresh_lock: Mutex<()>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, session: Arc<SessionStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sign in and store the token pair.
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url("auth/sign-in"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await?;
        let tokens: TokenPair = parse_json(response).await?;

        if !self.verify(&tokens.access).await? {
            return Err(DashboardError::LoginRequired);
        }

        self.session.update(|s| {
            s.access_token = Some(tokens.access);
            s.refresh_token = tokens.refresh;
            s.username = Some(username.to_string());
        });
        info!("Signed in as {}", username);
        Ok(())
    }

    /// Whether the API still accepts `token`.
    pub async fn verify(&self, token: &str) -> Result<bool> {
        let response = self
            .http
            .post(self.url("auth/sign-in/verify"))
            .json(&json!({ "token": token }))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status.is_client_error() {
            debug!("Token rejected by verify endpoint: {}", status);
            Ok(false)
        } else {
            Err(api_error(response).await)
        }
    }

    /// Exchange the refresh token for a new access token and store it.
    pub async fn refresh(&self) -> Result<String> {
        let Some(refresh) = self.session.refresh_token() else {
            return Err(DashboardError::LoginRequired);
        };

        let response = self
            .http
            .post(self.url("auth/sign-in/refresh"))
            .json(&json!({ "refresh": refresh }))
            .send()
            .await?;

        if response.status().is_client_error() {
            warn!("Refresh token rejected ({})", response.status());
            return Err(DashboardError::LoginRequired);
        }
        let tokens: TokenPair = parse_json(response).await?;

        self.session.update(|s| {
            s.access_token = Some(tokens.access.clone());
            if let Some(refresh) = tokens.refresh {
                s.refresh_token = Some(refresh);
            }
        });
        info!("Access token refreshed");
        Ok(tokens.access)
    }

    pub async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse> {
        let response = self
            .http
            .post(self.url("auth/sign-up"))
            .json(request)
            .send()
            .await?;
        let created: SignUpResponse = parse_json(response).await?;
        self.session.update(|s| {
            s.email = created.email.clone().or_else(|| Some(request.email.clone()));
            s.company = created
                .company_name
                .clone()
                .or_else(|| Some(request.company_name.clone()));
        });
        Ok(created)
    }

    pub async fn verify_email(&self, request: &VerifyEmailRequest) -> Result<()> {
        let response = self
            .http
            .post(self.url("auth/verify-email"))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    async fn send_with_token(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<Response> {
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Refresh unless another request already replaced the rejected token.
    async fn refresh_after_rejection(&self, rejected: Option<&str>) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(current) = self.session.access_token()
            && Some(current.as_str()) != rejected
        {
            return Ok(current);
        }
        self.refresh().await
    }

    /// Send with the session token, refreshing and retrying once on 401.
    pub(crate) async fn send_authorized(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response> {
        let token = match self.session.access_token() {
            Some(token) => token,
            None => self.refresh_after_rejection(None).await?,
        };

        let response = self.send_with_token(&method, path, body, &token).await?;
        let response = if response.status() == StatusCode::UNAUTHORIZED {
            debug!("{} {} unauthorized, refreshing token", method, path);
            let token = self.refresh_after_rejection(Some(&token)).await?;
            let retry = self.send_with_token(&method, path, body, &token).await?;
            if retry.status() == StatusCode::UNAUTHORIZED {
                return Err(DashboardError::LoginRequired);
            }
            retry
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send_authorized(Method::GET, path, None).await?;
        parse_json(response).await
    }

    pub(crate) async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        let response = self.send_authorized(method, path, Some(&body)).await?;
        parse_json(response).await
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<()> {
        self.send_authorized(Method::DELETE, path, None).await?;
        Ok(())
    }
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Build an API error, preferring the server's `detail` message.
async fn api_error(response: Response) -> DashboardError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);
    DashboardError::Api { status, detail }
}
