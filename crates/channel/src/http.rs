//! HTTP push backend.
//!
//! Talks to a push-messaging service exposing three JSON endpoints:
//! `sendDoseNotification`, `cancelDoseNotification` and `registerDevice`.
//! The service owns the actual fan-out to the device token.

use crate::provider::{
    AlarmChannel, AlarmHandle, ChannelError, ChannelFuture, ChannelKind, PendingAlarm,
    PermissionState, ScheduleRequest,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    dose_id: Option<&'a str>,
    user_id: &'a str,
    notification_id: u32,
    title: &'a str,
    body: &'a str,
    scheduled_at: String,
    token: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest<'a> {
    user_id: &'a str,
    notification_id: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    user_id: &'a str,
}

#[derive(Deserialize)]
struct PermissionResponse {
    /// Backend vocabulary, e.g. "granted" / "denied" / "prompt".
    receive: String,
}

/// Push-messaging channel backed by an HTTP function endpoint.
pub struct HttpPushChannel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    user_id: String,
}

impl HttpPushChannel {
    pub fn new(base_url: String, api_key: String, user_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            user_id,
        }
    }

    fn endpoint(&self, function: &str) -> String {
        format!("{}/{function}", self.base_url)
    }

    async fn post<B: Serialize>(&self, function: &str, body: &B) -> Result<reqwest::Response, ChannelError> {
        let resp = self
            .client
            .post(self.endpoint(function))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(check_error(status, text));
        }
        Ok(resp)
    }

    async fn send(&self, request: ScheduleRequest) -> Result<(), ChannelError> {
        let Some(token) = request.delivery_token.as_deref() else {
            return Err(ChannelError::PermissionDenied);
        };
        let body = SendRequest {
            dose_id: request.extra.occurrence_id.as_deref(),
            user_id: &self.user_id,
            notification_id: request.handle.0,
            title: &request.title,
            body: &request.body,
            scheduled_at: request.fire_at.to_rfc3339(),
            token: Some(token),
        };
        self.post("sendDoseNotification", &body).await?;
        tracing::debug!(handle = %request.handle, "push backup accepted by backend");
        Ok(())
    }

    async fn permission(&self, function: &str) -> Result<PermissionState, ChannelError> {
        let resp = self
            .post(function, &RegisterRequest { user_id: &self.user_id })
            .await?;
        let parsed: PermissionResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::RequestFailed(e.to_string()))?;
        Ok(PermissionState::normalize(&parsed.receive))
    }
}

/// Map an error status: auth failures mean the device lost its push grant.
fn check_error(status: reqwest::StatusCode, body: String) -> ChannelError {
    match status.as_u16() {
        401 | 403 => ChannelError::PermissionDenied,
        500..=599 => ChannelError::Unavailable(format!("{status}: {body}")),
        _ => ChannelError::RequestFailed(format!("{status}: {body}")),
    }
}

impl AlarmChannel for HttpPushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn check_permission(&self) -> ChannelFuture<'_, PermissionState> {
        Box::pin(self.permission("checkPushPermission"))
    }

    fn request_permission(&self) -> ChannelFuture<'_, PermissionState> {
        Box::pin(self.permission("registerDevice"))
    }

    fn schedule(&self, request: ScheduleRequest) -> ChannelFuture<'_, ()> {
        Box::pin(self.send(request))
    }

    fn cancel(&self, handle: AlarmHandle) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            let body = CancelRequest {
                user_id: &self.user_id,
                notification_id: handle.0,
            };
            self.post("cancelDoseNotification", &body).await?;
            Ok(())
        })
    }

    /// The backend keeps no queryable queue; nothing is reported as pending.
    fn pending(&self) -> ChannelFuture<'_, Vec<PendingAlarm>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Build the push channel from environment variables.
/// Reads `DOSEGUARD_PUSH_URL`, `DOSEGUARD_PUSH_KEY`; `user_id` addresses the account.
/// Returns `None` if URL or key is not set.
pub fn from_env(user_id: &str) -> Option<HttpPushChannel> {
    let base_url = std::env::var("DOSEGUARD_PUSH_URL").ok()?;
    let api_key = std::env::var("DOSEGUARD_PUSH_KEY").ok()?;
    Some(HttpPushChannel::new(base_url, api_key, user_id.to_owned()))
}
