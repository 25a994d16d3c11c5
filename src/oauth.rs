//! OAuth 握手编排
//!
//! 流程：
//! 1. 表单阶段：宿主给出一次性的 `state_url`，加密后嵌进登录链接
//! 2. 用户访问登录链接 → 跳转 provider 授权页（`state` 原样透传）
//! 3. provider 回调：解密 `state`，用 code 换 token，POST `{tokens, redirect}` 到 `state_url`（只发一次）
//! 4. 之后每次执行：从 `params.state_json` 取回状态，过期前先刷新

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::AppConfig;
use crate::crypto::{ActionCrypto, EncryptedPayload};
use crate::error::HubError;
use crate::request::{JobRequest, ParamMap};
use crate::response::{ActionForm, ActionState, FormField};

/// provider 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// provider 颁发的 token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    #[serde(default)]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// 过期时间（毫秒时间戳）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthTokens {
    /// 没有过期时间时视为长期有效
    pub fn expires_within(&self, margin: Duration) -> bool {
        let Some(expiry) = self.expiry_date else {
            return false;
        };
        let now = chrono::Utc::now().timestamp_millis();
        let margin_ms = i64::try_from(margin.as_millis()).unwrap_or(i64::MAX);
        now.saturating_add(margin_ms) >= expiry
    }
}

/// 宿主为每个用户保存的状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthState {
    pub tokens: OAuthTokens,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

/// 可直接使用的授权状态；`updated` 非空表示 token 已刷新，需要回传给宿主保存
#[derive(Debug, Clone)]
pub struct AuthorizedState {
    pub state: OAuthState,
    pub updated: Option<ActionState>,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenEndpointResponse {
    fn into_tokens(self, previous_refresh: Option<String>) -> OAuthTokens {
        let expiry_date = self
            .expires_in
            .map(|secs| chrono::Utc::now().timestamp_millis() + secs.saturating_mul(1000));
        OAuthTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expiry_date,
            token_type: self.token_type,
            scope: self.scope,
        }
    }
}

/// 单个 OAuth 动作的握手编排器
#[derive(Debug, Clone)]
pub struct OAuthOrchestrator {
    action_name: String,
    provider: OAuthProviderConfig,
    crypto: Arc<ActionCrypto>,
    base_url: String,
    refresh_margin: Duration,
    encrypt_state: bool,
    client: reqwest::Client,
}

impl OAuthOrchestrator {
    /// 基础地址与刷新余量取自全局配置；`ENCRYPT_PAYLOAD_<动作名大写>=true` 时加密保存的状态
    pub fn new(
        action_name: impl Into<String>,
        provider: OAuthProviderConfig,
        crypto: Arc<ActionCrypto>,
    ) -> Result<Self, HubError> {
        let action_name = action_name.into();
        let cfg = AppConfig::global();
        let encrypt_env = format!("ENCRYPT_PAYLOAD_{}", action_name.to_ascii_uppercase());
        let encrypt_state = std::env::var(&encrypt_env).is_ok_and(|v| v == "true");
        Ok(Self {
            action_name,
            provider,
            crypto,
            base_url: cfg.hub.base_url.clone(),
            refresh_margin: cfg.oauth.refresh_margin(),
            encrypt_state,
            client: crate::http::client_timeout_30s()?.clone(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn with_state_encryption(mut self, enabled: bool) -> Self {
        self.encrypt_state = enabled;
        self
    }

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    // =============== 1. 登录链接 ===============

    /// 把宿主的 `state_url` 加密后拼进本服务的 OAuth 入口地址
    pub fn login_url(&self, state_url: &str) -> Result<String, HubError> {
        let plaintext = json!({ "stateUrl": state_url }).to_string();
        let token = self.crypto.encrypt(&plaintext)?.to_token();
        let base = self.base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/actions/{}/oauth", self.action_name))
            .map_err(|e| HubError::Internal(format!("无效的 base_url {base}: {e}")))?;
        url.query_pairs_mut().append_pair("state", &token);
        Ok(url.to_string())
    }

    /// 未授权时展示的登录表单；同时让宿主丢弃旧状态
    pub fn login_form(&self, request: &JobRequest) -> Result<ActionForm, HubError> {
        let state_url = request
            .params
            .get("state_url")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                HubError::UnsupportedRequest("Request is missing a state_url for OAuth login.".into())
            })?;
        let oauth_url = self.login_url(state_url)?;
        tracing::debug!("生成登录表单 ({})", request.log_context());
        Ok(ActionForm {
            fields: vec![FormField {
                name: "login".into(),
                label: Some("Log in".into()),
                description: Some(
                    "In order to send to this destination, you will need to log in once to your account."
                        .into(),
                ),
                field_type: Some("oauth_link".into()),
                oauth_url: Some(oauth_url),
                ..Default::default()
            }],
            state: Some(ActionState::reset()),
            error: None,
        })
    }

    // =============== 2. provider 授权页 ===============

    pub fn authorize_url(&self, redirect_uri: &str, encrypted_state: &str) -> Result<String, HubError> {
        let mut url = Url::parse(&self.provider.authorize_url).map_err(|e| {
            HubError::Internal(format!("无效的 authorize_url {}: {e}", self.provider.authorize_url))
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.provider.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.provider.scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", encrypted_state);
        Ok(url.to_string())
    }

    // =============== 3. 回调 ===============

    /// provider 回调：换 token 并写回宿主（恰好一次 POST）
    pub async fn fetch_info(&self, url_params: &ParamMap, redirect_uri: &str) -> Result<(), HubError> {
        let state_url = self.decrypt_state_url(url_params)?;
        let code = self.callback_code(url_params)?;
        let tokens = self.exchange_code(code, redirect_uri).await?;
        self.post_state(
            &state_url,
            &json!({ "tokens": tokens, "redirect": redirect_uri }),
        )
        .await?;
        tracing::info!("OAuth 登录完成: action = {}", self.action_name);
        Ok(())
    }

    /// 变体：不在本服务换 token，把 code 原样交给宿主保存
    pub async fn post_code_state(&self, url_params: &ParamMap, redirect_uri: &str) -> Result<(), HubError> {
        let state_url = self.decrypt_state_url(url_params)?;
        let code = self.callback_code(url_params)?;
        self.post_state(&state_url, &json!({ "code": code, "redirect": redirect_uri }))
            .await
    }

    fn callback_code<'a>(&self, url_params: &'a ParamMap) -> Result<&'a str, HubError> {
        if let Some(err) = url_params.get("error") {
            return Err(HubError::MissingAuth(format!(
                "OAuth provider returned an error: {err}"
            )));
        }
        url_params
            .get("code")
            .map(String::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| HubError::MissingAuth("OAuth callback is missing the code.".into()))
    }

    fn decrypt_state_url(&self, url_params: &ParamMap) -> Result<String, HubError> {
        let token = url_params
            .get("state")
            .ok_or_else(|| HubError::MissingAuth("OAuth callback is missing the state.".into()))?;
        let payload = EncryptedPayload::from_token(token)?;
        let plaintext = self.crypto.decrypt(&payload).inspect_err(|e| {
            tracing::error!("OAuth state 解密失败: action = {}, {}", self.action_name, e);
        })?;
        let value: Value = serde_json::from_str(&plaintext)?;
        value
            .get("stateUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HubError::Decrypt("state payload has no stateUrl".into()))
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthTokens, HubError> {
        let resp = self
            .client
            .post(&self.provider.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.provider.client_id.as_str()),
                ("client_secret", self.provider.client_secret.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HubError::Handler(format!(
                "OAuth token exchange failed with HTTP {status}"
            )));
        }
        let body: TokenEndpointResponse = resp.json().await?;
        Ok(body.into_tokens(None))
    }

    async fn post_state(&self, state_url: &str, body: &Value) -> Result<(), HubError> {
        let resp = self.client.post(state_url).json(body).send().await?;
        let status = resp.status();
        // 宿主偶尔回非常规状态码，但状态已写入
        if status.is_success() || status.as_u16() < 200 {
            return Ok(());
        }
        tracing::error!("写回 OAuth 状态失败: HTTP {}", status);
        Err(HubError::Network(format!(
            "Host rejected the OAuth state update with HTTP {status}"
        )))
    }

    // =============== 4. 执行阶段 ===============

    /// 从 `params.state_json` 取回状态：加密信封先解密，否则按明文 JSON 解析
    pub fn extract_state(&self, request: &JobRequest) -> Result<OAuthState, HubError> {
        let raw = request
            .params
            .get("state_json")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HubError::MissingAuth("No OAuth state is stored for this user.".into()))?;

        let plaintext = match EncryptedPayload::from_json_str(raw) {
            Some(payload) => self.crypto.decrypt(&payload).map_err(|e| {
                tracing::error!("用户状态解密失败 ({}): {}", request.log_context(), e);
                HubError::MissingAuth("Stored OAuth state could not be read. Please log in again.".into())
            })?,
            None => raw.clone(),
        };

        let state: OAuthState = serde_json::from_str(&plaintext).map_err(|_| {
            HubError::MissingAuth("Stored OAuth state is invalid. Please log in again.".into())
        })?;
        // access_token / refresh_token / redirect 缺一不可
        let complete = !state.tokens.access_token.is_empty()
            && state.tokens.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
            && state.redirect.as_deref().is_some_and(|r| !r.is_empty());
        if !complete {
            tracing::info!("用户状态不完整，需要重新登录 ({})", request.log_context());
            return Err(HubError::MissingAuth(
                "Stored OAuth state is incomplete. Please log in again.".into(),
            ));
        }
        Ok(state)
    }

    /// 过期（或即将过期）时刷新；返回 `(状态, 是否刷新过)`
    pub async fn ensure_fresh(&self, state: OAuthState) -> Result<(OAuthState, bool), HubError> {
        let stale =
            state.tokens.access_token.is_empty() || state.tokens.expires_within(self.refresh_margin);
        if !stale {
            return Ok((state, false));
        }
        let refreshed = self.refresh(&state.tokens).await?;
        Ok((
            OAuthState {
                tokens: refreshed,
                redirect: state.redirect,
            },
            true,
        ))
    }

    /// 任何刷新失败（网络、状态码、响应体）都归为 `MissingAuth`，让宿主重新走登录
    pub async fn refresh(&self, tokens: &OAuthTokens) -> Result<OAuthTokens, HubError> {
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| HubError::MissingAuth("Access token expired. Please log in again.".into()))?;
        match self.request_refresh(refresh_token).await {
            Ok(body) => Ok(body.into_tokens(tokens.refresh_token.clone())),
            Err(e) => {
                tracing::warn!("刷新 token 失败: action = {}, {}", self.action_name, e);
                Err(HubError::MissingAuth(
                    "Could not refresh the access token. Please log in again.".into(),
                ))
            }
        }
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenEndpointResponse, HubError> {
        let resp = self
            .client
            .post(&self.provider.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.provider.client_id.as_str()),
                ("client_secret", self.provider.client_secret.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HubError::Handler(format!("token endpoint returned HTTP {status}")));
        }
        Ok(resp.json().await?)
    }

    /// 取回并按需刷新；刷新后的状态需随执行结果回传
    pub async fn authorize(&self, request: &JobRequest) -> Result<AuthorizedState, HubError> {
        let state = self.extract_state(request)?;
        let (state, refreshed) = self.ensure_fresh(state).await?;
        let updated = if refreshed {
            Some(ActionState::data(self.state_blob(&state)?))
        } else {
            None
        };
        Ok(AuthorizedState { state, updated })
    }

    /// 状态序列化为宿主保存的 blob
    pub fn state_blob(&self, state: &OAuthState) -> Result<String, HubError> {
        let json = serde_json::to_string(state)?;
        if self.encrypt_state {
            self.crypto.encrypt(&json)?.to_json()
        } else {
            Ok(json)
        }
    }
}
