//! Directory binding for a Supabase (PostgREST) backend.
//!
//! Users live in a `users` table keyed by `username`; queued payloads live in
//! a `messages` table. Binary columns are base64 text.

use crate::crypto::X25519_KEY_LENGTH;
use crate::network::{DirectoryClient, DirectoryRecord, OfflineMessage, Registration};
use crate::utils::{DirectoryConfig, DirectoryError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

const USERS_TABLE: &str = "users";
const MESSAGES_TABLE: &str = "messages";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRow {
    username: String,
    node_id: String,
    public_key: String,
    signing_key: String,
    last_ip: String,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct Heartbeat<'a> {
    last_ip: &'a str,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct NewMessage<'a> {
    to_user: &'a str,
    from_user: &'a str,
    ciphertext: String,
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    id: i64,
    from_user: String,
    ciphertext: String,
}

impl UserRow {
    fn into_record(self) -> Result<DirectoryRecord> {
        Ok(DirectoryRecord {
            encryption_public: decode_key::<X25519_KEY_LENGTH>("public_key", &self.public_key)?,
            signing_public: decode_key::<32>("signing_key", &self.signing_key)?,
            username: self.username,
            node_id: self.node_id,
            address: self.last_ip,
            last_seen: self.last_seen,
        })
    }
}

/// Directory client speaking PostgREST to a Supabase project
#[derive(Clone)]
pub struct SupabaseDirectory {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl SupabaseDirectory {
    /// Build a client from the directory configuration
    pub fn new(config: &DirectoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout())
            .build()
            .map_err(DirectoryError::from)?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DirectoryError::BadResponse {
        reason: format!("status={status} body={body}"),
    }
    .into())
}

fn decode_key<const N: usize>(column: &str, value: &str) -> Result<[u8; N]> {
    let bytes = STANDARD.decode(value).map_err(|_| DirectoryError::BadResponse {
        reason: format!("{column} is not valid base64"),
    })?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        DirectoryError::BadResponse {
            reason: format!("{column} has {} bytes, expected {N}", bytes.len()),
        }
        .into()
    })
}

#[async_trait]
impl DirectoryClient for SupabaseDirectory {
    async fn register(&self, registration: &Registration) -> Result<()> {
        let row = UserRow {
            username: registration.username.clone(),
            node_id: registration.node_id.clone(),
            public_key: STANDARD.encode(registration.encryption_public),
            signing_key: STANDARD.encode(registration.signing_public),
            last_ip: registration.address.clone(),
            last_seen: Utc::now(),
        };
        let response = self
            .request(Method::POST, USERS_TABLE)
            .query(&[("on_conflict", "username")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row])
            .send()
            .await
            .map_err(DirectoryError::from)?;
        check(response).await?;
        log::debug!("Registered {} with directory", registration.username);
        Ok(())
    }

    async fn heartbeat(&self, username: &str, address: &str) -> Result<()> {
        let response = self
            .request(Method::PATCH, USERS_TABLE)
            .query(&[("username", format!("eq.{username}"))])
            .header("Prefer", "return=minimal")
            .json(&Heartbeat {
                last_ip: address,
                last_seen: Utc::now(),
            })
            .send()
            .await
            .map_err(DirectoryError::from)?;
        check(response).await?;
        Ok(())
    }

    async fn lookup(&self, username: &str) -> Result<Option<DirectoryRecord>> {
        let response = self
            .request(Method::GET, USERS_TABLE)
            .query(&[("username", format!("eq.{username}")), ("select", "*".to_string())])
            .send()
            .await
            .map_err(DirectoryError::from)?;
        let rows: Vec<UserRow> = check(response)
            .await?
            .json()
            .await
            .map_err(DirectoryError::from)?;
        rows.into_iter().next().map(UserRow::into_record).transpose()
    }

    async fn push_offline_message(&self, to: &str, from: &str, ciphertext: &[u8]) -> Result<()> {
        let response = self
            .request(Method::POST, MESSAGES_TABLE)
            .header("Prefer", "return=minimal")
            .json(&NewMessage {
                to_user: to,
                from_user: from,
                ciphertext: STANDARD.encode(ciphertext),
            })
            .send()
            .await
            .map_err(DirectoryError::from)?;
        check(response).await?;
        Ok(())
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<OfflineMessage>> {
        let response = self
            .request(Method::GET, MESSAGES_TABLE)
            .query(&[
                ("to_user", format!("eq.{username}")),
                ("select", "id,from_user,ciphertext".to_string()),
                ("order", "id.asc".to_string()),
            ])
            .send()
            .await
            .map_err(DirectoryError::from)?;
        let rows: Vec<MessageRow> = check(response)
            .await?
            .json()
            .await
            .map_err(DirectoryError::from)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids = rows.iter().map(|row| row.id.to_string()).collect::<Vec<_>>().join(",");
        let response = self
            .request(Method::DELETE, MESSAGES_TABLE)
            .query(&[("id", format!("in.({ids})"))])
            .send()
            .await
            .map_err(DirectoryError::from)?;
        check(response).await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            match STANDARD.decode(&row.ciphertext) {
                Ok(ciphertext) => messages.push(OfflineMessage {
                    from: row.from_user,
                    ciphertext,
                }),
                Err(_) => log::warn!("Dropping offline message {} with undecodable payload", row.id),
            }
        }
        Ok(messages)
    }
}
