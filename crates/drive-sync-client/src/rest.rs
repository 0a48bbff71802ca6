//! Typed client for the REST endpoints the realtime layer leans on: auth,
//! conversations and message history.

use crate::error::ClientError;
use drive_sync_core::{ChatMessage, Conversation, User};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    email: &'a str,
    password: &'a str,
    display_name: &'a str,
}

#[derive(Serialize)]
struct CreateConversationRequest<'a> {
    title: &'a str,
}

#[derive(Debug, Clone)]
pub struct DriveApi {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl DriveApi {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ClientError::Config(format!("failed to create HTTP client: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder) -> Result<RequestBuilder, ClientError> {
        let token = self.token.as_deref().ok_or(ClientError::Unauthorized)?;
        Ok(request.bearer_auth(token))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, ClientError> {
        let request = self
            .http
            .post(self.url("/auth/login"))
            .json(&LoginRequest { email, password });
        decode(request.send().await?).await
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<User, ClientError> {
        let request = self.http.post(self.url("/auth/register")).json(&RegisterRequest {
            email,
            password,
            display_name,
        });
        decode(request.send().await?).await
    }

    pub async fn me(&self) -> Result<User, ClientError> {
        let request = self.authed(self.http.get(self.url("/users/me")))?;
        decode(request.send().await?).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        let request = self.authed(self.http.get(self.url("/drive/conversations")))?;
        decode(request.send().await?).await
    }

    pub async fn create_conversation(&self, title: &str) -> Result<Conversation, ClientError> {
        let request = self
            .authed(self.http.post(self.url("/drive/conversations")))?
            .json(&CreateConversationRequest { title });
        decode(request.send().await?).await
    }

    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ClientError> {
        let path = format!("/drive/conversations/{conversation_id}/messages");
        let request = self.authed(self.http.get(self.url(&path)))?;
        decode(request.send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthorized);
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        return Err(ClientError::Api {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|err| ClientError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authed_requests_need_a_token() {
        let api = DriveApi::new("http://localhost:8000/api/v1/").expect("client");
        assert_eq!(api.base_url(), "http://localhost:8000/api/v1");
        let err = api
            .authed(api.http.get(api.url("/users/me")))
            .expect_err("no token");
        assert!(matches!(err, ClientError::Unauthorized));

        let api = api.with_token(Some("tok".to_string()));
        let request = api
            .authed(api.http.get(api.url("/users/me")))
            .expect("token")
            .build()
            .expect("request");
        assert_eq!(request.url().as_str(), "http://localhost:8000/api/v1/users/me");
        assert_eq!(
            request
                .headers()
                .get(reqwest::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok()),
            Some("Bearer tok")
        );
    }

    #[test]
    fn token_pair_tolerates_missing_refresh() {
        let pair: TokenPair = serde_json::from_str(r#"{"access_token":"a"}"#).expect("decode");
        assert_eq!(pair.refresh_token, None);
    }
}
