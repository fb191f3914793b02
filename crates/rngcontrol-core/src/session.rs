//! Authenticated session with the scheduling service.
//!
//! The service authenticates with a session cookie set by `POST /user/login`.
//! A single cookie jar is shared by every outbound request; logging in again
//! refreshes the credential in place rather than creating a second session.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;

use crate::config::ControlConfig;
use crate::error::{ControlError, Result};

/// Anything that can (re-)establish the authenticated session.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self) -> Result<()>;
}

/// Optional application-level message carried by service responses.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct MessageBody {
    pub message: Option<String>,
}

/// Holds the HTTP client and the session credential for the scheduling service.
pub struct SessionManager {
    client: Client,
    jar: Arc<Jar>,
    base: Url,
    config: Arc<ControlConfig>,
}

impl SessionManager {
    /// Build the HTTP client. Does not contact the service.
    pub fn new(config: Arc<ControlConfig>) -> Result<Self> {
        let base = Url::parse(&config.service_url)
            .map_err(|e| ControlError::Config(format!("service url: {e}")))?;
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            jar,
            base,
            config,
        })
    }

    /// POST to a service path with the session credential attached.
    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.config.service_endpoint(path))
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// The current `Cookie` header value, if a session has been established.
    pub fn credential(&self) -> Option<String> {
        self.jar
            .cookies(&self.base)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential().is_some()
    }
}

#[async_trait]
impl Authenticator for SessionManager {
    async fn login(&self) -> Result<()> {
        log::info!(
            "Logging in to {} as {}",
            self.config.service_url,
            self.config.email
        );
        let resp = self
            .post("/user/login")
            .form(&[
                ("email", self.config.email.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ControlError::Auth(format!("login request failed: {e}")))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ControlError::Auth(format!("login rejected with {status}")));
        }
        if !status.is_success() {
            return Err(ControlError::Auth(format!("login failed with {status}")));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| ControlError::Auth(format!("login response unreadable: {e}")))?;
        if let Ok(MessageBody {
            message: Some(message),
        }) = serde_json::from_str::<MessageBody>(&body)
        {
            return Err(ControlError::Auth(message));
        }

        match self.credential() {
            Some(cookie) => {
                log::info!("Session established ({} cookie bytes)", cookie.len());
                Ok(())
            }
            None => Err(ControlError::Auth(
                "login succeeded but no session credential was set".to_string(),
            )),
        }
    }
}
