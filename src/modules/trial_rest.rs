// Supabase / PostgREST 试用记录存储
// 基于 reqwest 封装
//
// Lookups ask for a single JSON object. PostgREST answers "no rows" with
// HTTP 406 and error code PGRST116; that sentinel, and only that sentinel,
// means NotFound. Everything else that is not a 2xx is a store fault.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use tokio::time::Duration;

use crate::error::StoreError;
use crate::models::trial::{ConditionalGrant, TrialAttempt, TrialGrant, TrialLookup};
use crate::trial::store::TrialStore;

const USER_AGENT: &str = concat!("trial-gateway/", env!("CARGO_PKG_VERSION"));

/// PostgREST error code for "JSON object requested, multiple (or no) rows returned"
pub const PGRST_NO_ROWS: &str = "PGRST116";

const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";
const GRANT_COLUMNS: &str = "user_identifier,trial_granted_at,expires_at";

/// Error body returned by PostgREST
#[derive(Debug, Clone, Deserialize)]
pub struct PostgrestError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl PostgrestError {
    /// True only for the single-object "zero rows" case.
    pub fn is_no_rows(&self) -> bool {
        self.code.as_deref() == Some(PGRST_NO_ROWS)
            && self.details.as_deref().map_or(true, |d| d.contains("0 rows"))
    }
}

pub struct RestTrialStore {
    client: Client,
    base_url: String,
    service_key: String,
    table: String,
    audit_table: String,
}

impl RestTrialStore {
    pub fn new(
        base_url: &str,
        service_key: &str,
        table: &str,
        audit_table: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            table: table.to_string(),
            audit_table: audit_table.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn lookup_inner(&self, identifier: &str) -> Result<TrialLookup, StoreError> {
        let filter = format!("eq.{}", identifier);
        let resp = self
            .authorized(self.client.get(self.table_url(&self.table)))
            .query(&[("user_identifier", filter.as_str()), ("select", GRANT_COLUMNS)])
            .header(header::ACCEPT, SINGLE_OBJECT)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            let body = resp.text().await?;
            let grant: TrialGrant = serde_json::from_str(&body)
                .map_err(|e| StoreError::Decode(format!("grant row: {}", e)))?;
            return Ok(TrialLookup::Found(grant));
        }

        let err = read_error(resp).await;
        if status == StatusCode::NOT_ACCEPTABLE && err.as_ref().is_some_and(|e| e.is_no_rows()) {
            return Ok(TrialLookup::NotFound);
        }
        Err(fault(status, err))
    }

    async fn upsert_inner(&self, grant: &TrialGrant) -> Result<(), StoreError> {
        let resp = self
            .authorized(self.client.post(self.table_url(&self.table)))
            .query(&[("on_conflict", "user_identifier")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(grant)
            .send()
            .await?;
        ensure_success(resp).await
    }

    async fn append_inner(&self, attempt: &TrialAttempt) -> Result<(), StoreError> {
        let resp = self
            .authorized(self.client.post(self.table_url(&self.audit_table)))
            .header("Prefer", "return=minimal")
            .json(attempt)
            .send()
            .await?;
        ensure_success(resp).await
    }
}

async fn read_error(resp: Response) -> Option<PostgrestError> {
    let body = resp.text().await.ok()?;
    serde_json::from_str(&body).ok()
}

fn fault(status: StatusCode, err: Option<PostgrestError>) -> StoreError {
    match err {
        Some(e) => StoreError::Query(format!(
            "{} {}: {}",
            status.as_u16(),
            e.code.unwrap_or_default(),
            e.message.unwrap_or_default()
        )),
        None => StoreError::Query(format!("{} without error body", status.as_u16())),
    }
}

async fn ensure_success(resp: Response) -> Result<(), StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    Err(fault(status, read_error(resp).await))
}

impl TrialStore for RestTrialStore {
    fn lookup<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, Result<TrialLookup, StoreError>> {
        self.lookup_inner(identifier).boxed()
    }

    fn upsert<'a>(&'a self, grant: &'a TrialGrant) -> BoxFuture<'a, Result<(), StoreError>> {
        self.upsert_inner(grant).boxed()
    }

    fn grant_if_eligible<'a>(
        &'a self,
        _grant: &'a TrialGrant,
        _now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<ConditionalGrant, StoreError>> {
        futures::future::ready(Err(StoreError::Unsupported(
            "conditional grant needs a single-statement write",
        )))
        .boxed()
    }

    fn append_attempt<'a>(
        &'a self,
        attempt: &'a TrialAttempt,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.append_inner(attempt).boxed()
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}
