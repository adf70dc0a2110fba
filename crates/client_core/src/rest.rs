use std::sync::Arc;

use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::UserId,
    protocol::{
        ChatMessageDto, ChatSummary, CredentialsRequest, Page, RefreshRequest, RefreshResponse,
        TokenPair, UserSummary,
    },
};
use tracing::{info, warn};
use url::Url;

use crate::{error::GatewayError, session::AuthTokens};

/// Authenticated wrapper over the backend's `/api/v1` surface. Attaches the
/// bearer credential to every request and, on a 401, transparently refreshes
/// the access credential once and retries the original request once. A second
/// rejection surfaces as [`GatewayError::Unauthenticated`].
pub struct ApiGateway {
    http: Client,
    base_url: String,
    tokens: Arc<AuthTokens>,
}

impl ApiGateway {
    pub fn new(base_url: impl Into<String>, tokens: Arc<AuthTokens>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
            tokens,
        }
    }

    pub async fn obtain_tokens(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenPair, GatewayError> {
        let response = self
            .http
            .post(format!("{}/users/token/", self.base_url))
            .json(&CredentialsRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserSummary, GatewayError> {
        let response = self
            .http
            .post(format!("{}/users/", self.base_url))
            .json(&CredentialsRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn fetch_me(&self) -> Result<UserSummary, GatewayError> {
        self.get_json(&format!("{}/users/im/", self.base_url)).await
    }

    pub async fn fetch_user(&self, user_id: UserId) -> Result<UserSummary, GatewayError> {
        self.get_json(&format!("{}/users/{}/", self.base_url, user_id.0))
            .await
    }

    pub async fn list_chats(&self) -> Result<Page<ChatSummary>, GatewayError> {
        self.get_json(&format!("{}/chats/", self.base_url)).await
    }

    pub async fn list_messages(
        &self,
        interlocutor: UserId,
    ) -> Result<Page<ChatMessageDto>, GatewayError> {
        self.get_json(&format!(
            "{}/chats/{}/messages/",
            self.base_url, interlocutor.0
        ))
        .await
    }

    /// Follows an opaque `next` cursor returned by a previous page. The
    /// cursor is an absolute URL minted by the backend.
    pub async fn fetch_page<T: DeserializeOwned>(
        &self,
        next: &str,
    ) -> Result<Page<T>, GatewayError> {
        let url = Url::parse(next).map_err(|err| GatewayError::Api {
            code: shared::error::ErrorCode::Validation,
            message: format!("invalid pagination cursor '{next}': {err}"),
        })?;
        self.get_json(url.as_str()).await
    }

    pub async fn read_all_messages(&self, interlocutor: UserId) -> Result<(), GatewayError> {
        let url = format!(
            "{}/chats/{}/read-all-messages/",
            self.base_url, interlocutor.0
        );
        self.send_authorized(Method::POST, &url).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GatewayError> {
        let response = self.send_authorized(Method::GET, url).await?;
        Ok(response.json().await?)
    }

    /// Core request path: send with the current access credential; on a 401,
    /// refresh once and retry once.
    async fn send_authorized(&self, method: Method, url: &str) -> Result<Response, GatewayError> {
        let access = self.tokens.access().await;
        let response = self.dispatch(method.clone(), url, access).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        info!(%url, "access credential rejected; attempting refresh");
        let refreshed = self.refresh_access().await?;
        let retried = self.dispatch(method, url, Some(refreshed)).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!(%url, "request rejected again after credential refresh");
            return Err(GatewayError::Unauthenticated);
        }
        check_status(retried).await
    }

    async fn dispatch(
        &self,
        method: Method,
        url: &str,
        access: Option<String>,
    ) -> Result<Response, GatewayError> {
        let mut request = self.http.request(method, url);
        if let Some(access) = access {
            request = request.bearer_auth(access);
        }
        Ok(request.send().await?)
    }

    async fn refresh_access(&self) -> Result<String, GatewayError> {
        let Some(refresh) = self.tokens.refresh().await else {
            return Err(GatewayError::Unauthenticated);
        };

        let response = self
            .http
            .post(format!("{}/users/token/refresh/", self.base_url))
            .json(&RefreshRequest { refresh })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Unauthenticated);
        }

        let body: RefreshResponse = response.json().await?;
        self.tokens.update_access(body.access.clone()).await;
        Ok(body.access)
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(GatewayError::from_status(status, message))
}
