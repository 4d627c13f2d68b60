//! HTTP story source speaking the private mobile API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::{Client, Proxy, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::models::{LoginResponse, ReelsTrayResponse, TrayUser, UserStoryResponse};
use super::session::{Reply, Session};
use super::{AuthError, StorySource};
use crate::stages::types::StoryItem;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct InstagramConfig {
    pub api_base: String,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub proxy: Option<String>,
    pub credentials: Option<Credentials>,
}

pub struct InstagramClient {
    http: Client,
    api_base: String,
    credentials: Option<Credentials>,
}

impl InstagramClient {
    pub fn new(config: InstagramConfig) -> Result<Self, AuthError> {
        let mut builder = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent);

        if let Some(url) = config.proxy.as_deref().filter(|url| !url.is_empty()) {
            let proxy = Proxy::all(url).map_err(|e| AuthError::Request(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let http = builder
            .build()
            .map_err(|e| AuthError::Request(e.to_string()))?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            credentials: config.credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    async fn send(&self, request: RequestBuilder, session: &Session) -> Result<(Response, Session), AuthError> {
        let request = match session.cookie_header() {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let mut next = session.clone();
        next.absorb_set_cookie(response.headers());
        Ok((response, next))
    }

    async fn get_json<T: DeserializeOwned>(&self, session: &Session, path: &str) -> Result<Reply<T>, AuthError> {
        let (response, session) = self.send(self.http.get(self.url(path)), session).await?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(AuthError::Rejected(format!("{path} returned {status}")));
        }
        if !status.is_success() {
            return Err(AuthError::Request(format!("{path} returned {status}")));
        }

        let value = response
            .json::<T>()
            .await
            .map_err(|e| AuthError::Decode(format!("{path}: {e}")))?;
        Ok(Reply { value, session })
    }
}

#[async_trait]
impl StorySource for InstagramClient {
    async fn login(&self, saved: Session) -> Result<Session, AuthError> {
        let credentials = self.credentials.as_ref().ok_or(AuthError::MissingCredentials)?;

        if saved.is_authenticated() {
            debug!("Reusing saved session");
            return Ok(saved);
        }

        let request = self.http.post(self.url("accounts/login/")).form(&[
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
        ]);
        let (response, mut session) = self.send(request, &saved).await?;

        let status = response.status();
        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Decode(format!("login: {e}")))?;

        let user = match (status.is_success(), body.logged_in_user) {
            (true, Some(user)) => user,
            (_, _) => {
                let message = body.message.unwrap_or_else(|| status.to_string());
                return Err(AuthError::Rejected(message));
            }
        };

        session.user_id = Some(user.pk.to_string());
        info!(username = %credentials.username, "Logged in");
        Ok(session)
    }

    async fn reels_tray(&self, session: &Session) -> Result<Reply<Vec<TrayUser>>, AuthError> {
        let reply: Reply<ReelsTrayResponse> = self.get_json(session, "feed/reels_tray/").await?;
        let users: Vec<TrayUser> = reply.value.tray.into_iter().map(TrayUser::from).collect();
        debug!(users = users.len(), "Fetched story tray");
        Ok(Reply {
            value: users,
            session: reply.session,
        })
    }

    async fn user_story(&self, session: &Session, user: &TrayUser) -> Result<Reply<Vec<StoryItem>>, AuthError> {
        let path = format!("feed/user/{}/story/", user.pk);
        let reply: Reply<UserStoryResponse> = self.get_json(session, &path).await?;
        Ok(Reply {
            value: reply.value.into_items(),
            session: reply.session,
        })
    }
}
