//! Generic OAuth2 user-info exchange used to bootstrap a local session.
//!
//! The connector is a relying party only: given a provider access token it
//! fetches the user-info document and mints a local session pair for the
//! resolved subject. The REST transport is a narrow trait with a
//! reqwest-backed default.

use std::{env, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::instrument;
use url::Url;

use crate::{
    error::AuthError,
    session::{SessionCell, SessionTokens, SessionType, TokenOptions, generate_session_tokens},
};

const GOOGLE_AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_USERINFO_ENDPOINT: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// OAuth2 REST transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get_json(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> anyhow::Result<Value>;

    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
    ) -> anyhow::Result<Value>;
}

/// Default transport over reqwest with rustls.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// # Errors
    ///
    /// Returns an error when the underlying client cannot be built.
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(crate::APP_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_json(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> anyhow::Result<Value> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!("GET {url} failed: {status}"));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
    ) -> anyhow::Result<Value> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!("POST {url} failed: {status}"));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Provider endpoints and client credentials.
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_endpoint: String,
    pub userinfo_endpoint: String,
    pub scopes: Vec<String>,
}

impl OAuth2Config {
    /// Google configuration from `GOOGLE_OAUTH2_CLIENT_ID`, `…_CLIENT_SECRET`
    /// and `…_REDIRECT_URI`.
    ///
    /// # Errors
    ///
    /// Returns an internal error naming the first missing variable.
    pub fn google_from_env() -> Result<Self, AuthError> {
        Ok(Self {
            client_id: required_env("GOOGLE_OAUTH2_CLIENT_ID")?,
            client_secret: required_env("GOOGLE_OAUTH2_CLIENT_SECRET")?,
            redirect_uri: required_env("GOOGLE_OAUTH2_REDIRECT_URI")?,
            auth_endpoint: GOOGLE_AUTH_ENDPOINT.to_string(),
            userinfo_endpoint: GOOGLE_USERINFO_ENDPOINT.to_string(),
            scopes: vec!["email".to_string(), "profile".to_string()],
        })
    }
}

fn required_env(name: &str) -> Result<String, AuthError> {
    env::var(name).map_err(|_| {
        AuthError::internal(
            "MISSING_OAUTH2_CONFIG",
            format!("Missing environment variable {name}"),
        )
    })
}

/// User-info fields the session bootstrap cares about; providers may send
/// more.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OAuth2User {
    pub id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

pub struct OAuth2Connector {
    config: OAuth2Config,
    http: Arc<dyn HttpClient>,
}

impl OAuth2Connector {
    #[must_use]
    pub fn new(config: OAuth2Config, http: Arc<dyn HttpClient>) -> Self {
        Self { config, http }
    }

    /// Build the provider consent URL for the implicit flow.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the configured endpoint is not a valid
    /// URL.
    pub fn auth_url(&self, state: Option<&str>) -> Result<String, AuthError> {
        let mut url = Url::parse(&self.config.auth_endpoint).map_err(|err| {
            AuthError::internal(
                "MISSING_OAUTH2_CONFIG",
                format!("Invalid auth endpoint: {err}"),
            )
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "token")
            .append_pair("scope", &self.config.scopes.join(" "));
        if let Some(state) = state {
            url.query_pairs_mut().append_pair("state", state);
        }
        Ok(url.into())
    }

    /// Exchange a provider access token for the user-info document and a
    /// local session pair.
    ///
    /// The session subject is the user's email, falling back to the provider
    /// id.
    ///
    /// # Errors
    ///
    /// `FORBIDDEN` when the provider rejects the token or the document
    /// carries neither email nor id; token-builder failures otherwise.
    #[instrument(skip(self, cell, access_token))]
    pub async fn authenticate(
        &self,
        cell: &SessionCell,
        access_token: &str,
    ) -> Result<(OAuth2User, SessionTokens), AuthError> {
        let headers = vec![(
            "Authorization".to_string(),
            format!("Bearer {access_token}"),
        )];
        let document = self
            .http
            .get_json(&self.config.userinfo_endpoint, &headers)
            .await
            .map_err(|err| {
                AuthError::forbidden(
                    "INVALID_TOKEN",
                    format!("OAuth2 user-info exchange failed: {err}"),
                )
            })?;

        let user: OAuth2User = serde_json::from_value(document).map_err(|_| {
            AuthError::forbidden("INVALID_TOKEN", "Malformed OAuth2 user-info document.")
        })?;

        let subject = user
            .email
            .clone()
            .or_else(|| user.id.clone())
            .ok_or_else(|| {
                AuthError::forbidden(
                    "INVALID_TOKEN",
                    "OAuth2 user-info document has no usable subject.",
                )
            })?;

        let mut payload = Map::new();
        if let Some(email) = &user.email {
            payload.insert("email".to_string(), json!(email));
        }
        if let Some(name) = &user.name {
            payload.insert("name".to_string(), json!(name));
        }
        if let Some(picture) = &user.picture {
            payload.insert("picture".to_string(), json!(picture));
        }

        let tokens = generate_session_tokens(
            cell,
            &TokenOptions {
                subject: Some(subject),
                payload: Some(payload),
                ..TokenOptions::new(SessionType::User)
            },
        )?;

        Ok((user, tokens))
    }
}
