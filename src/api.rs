// src/api.rs

//! REST client for the backend's notification endpoints.
//!
//! - `GET {api}/notifications/unread/{user}` feeds the polling fallback
//! - `GET|DELETE {api}/residents/{email}/notifications`
//! - `GET|DELETE {api}/prestataires/{neq}/notifications`
//! - `GET|DELETE {api}/stpm/notifications`
//!
//! Non-success responses become [`NotifyError::Api`] carrying the backend's
//! `message` (or `error`) field when it sent one.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

use crate::domain::{NotificationPayload, UserIdentity};
use crate::macros::log_debug;
use crate::{NotifyError, Result};

/// One stored notification as the backend returns it.
///
/// The unread endpoint serializes the entity (`typeChangement`,
/// `dateCreation`), list endpoints a summary (`type`, `date`); both map here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationRecord {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "type", alias = "typeChangement")]
    pub kind: Option<String>,
    #[serde(alias = "dateCreation", deserialize_with = "lenient_string")]
    pub date: Option<String>,
    pub lu: bool,
    pub projet_id: Option<i64>,
    pub destinataire: Option<String>,
    pub type_destinataire: Option<String>,
}

/// Accept a string, a number, or a structured date; `null` is `None`.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    // ---
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl NotificationRecord {
    /// Push payload equivalent of this record. A missing or blank type is
    /// `GENERAL`; a blank message is dropped.
    pub fn to_payload(&self) -> NotificationPayload {
        // ---
        NotificationPayload {
            id: self.id.clone().unwrap_or_default(),
            message: self.message.clone().filter(|m| !m.is_empty()),
            kind: self
                .kind
                .clone()
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| "GENERAL".to_string()),
            date: self.date.clone().unwrap_or_default(),
            projet_id: self.projet_id,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NotificationList {
    pub notifications: Vec<NotificationRecord>,
    pub total: u64,
    /// Unread count; only the residents endpoint reports it.
    pub non_lues: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClearResult {
    pub success: bool,
    pub message: String,
    pub count: u64,
}

/// Source of unread notifications for the polling fallback.
#[async_trait::async_trait]
pub trait UnreadSource: Send + Sync + 'static {
    async fn fetch_unread(&self, user: &str) -> Result<Vec<NotificationRecord>>;
}

/// HTTP client for the notification REST API.
#[derive(Clone, Debug)]
pub struct NotificationsApi {
    client: reqwest::Client,
    base: Url,
}

impl NotificationsApi {
    // ---
    pub fn new(client: reqwest::Client, api_url: &str) -> Result<Self> {
        // ---
        let base = Url::parse(api_url)?;
        if base.cannot_be_a_base() {
            return Err(NotifyError::InvalidConfig(format!(
                "{api_url} cannot be a base URL"
            )));
        }
        Ok(Self { client, base })
    }

    /// Build a `reqwest` client with the given connect timeout.
    pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder().connect_timeout(timeout).build()?)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        // ---
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn identity_endpoint(&self, identity: &UserIdentity) -> Url {
        // ---
        match identity {
            UserIdentity::Resident { email } => self.endpoint(&["residents", email.as_str(), "notifications"]),
            UserIdentity::Prestataire { neq } => self.endpoint(&["prestataires", neq.as_str(), "notifications"]),
            UserIdentity::Stpm => self.endpoint(&["stpm", "notifications"]),
        }
    }

    async fn execute<T>(&self, request: reqwest::RequestBuilder) -> Result<T>
    where
        T: DeserializeOwned,
    {
        // ---
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| {
            format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error")
            )
        });

        Err(NotifyError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn fetch_unread(&self, user: &str) -> Result<Vec<NotificationRecord>> {
        // ---
        let url = self.endpoint(&["notifications", "unread", user]);
        log_debug!("api: GET {url}");
        self.execute(self.client.get(url)).await
    }

    /// Every stored notification of `identity`.
    pub async fn list(&self, identity: &UserIdentity) -> Result<NotificationList> {
        // ---
        let url = self.identity_endpoint(identity);
        log_debug!("api: GET {url}");
        self.execute(self.client.get(url)).await
    }

    /// Delete every stored notification of `identity`.
    pub async fn clear_all(&self, identity: &UserIdentity) -> Result<ClearResult> {
        // ---
        let url = self.identity_endpoint(identity);
        log_debug!("api: DELETE {url}");
        self.execute(self.client.delete(url)).await
    }
}

#[async_trait::async_trait]
impl UnreadSource for NotificationsApi {
    async fn fetch_unread(&self, user: &str) -> Result<Vec<NotificationRecord>> {
        NotificationsApi::fetch_unread(self, user).await
    }
}

/// Human-readable message from an error body.
///
/// JSON objects yield `message`, then `error`, then the object itself; other
/// bodies are used as trimmed text.
fn error_message(body: &str) -> Option<String> {
    // ---
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) else {
        return Some(body.to_string());
    };

    let field = |name: &str| {
        map.get(name).filter(|v| !v.is_null()).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };

    field("message")
        .or_else(|| field("error"))
        .or_else(|| (!map.is_empty()).then(|| Value::Object(map.clone()).to_string()))
}
