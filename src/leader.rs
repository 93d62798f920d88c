// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Leader transport.
//!
//! [`LeaderClient`] is the seam between the syncers and the leader's
//! replication API. [`HttpLeaderClient`] implements it over HTTP with:
//!
//! - basic or bearer authentication
//! - transport retries with capped exponential backoff
//! - two circuit breakers (control calls and bulk data calls)
//! - a token bucket bounding the request rate
//!
//! # Endpoints
//!
//! ```text
//! GET    /_api/version?details=true            leader version + engine
//! GET    /_api/replication/logger-state        leader server id
//! POST   /_api/replication/batch               start batch
//! PUT    /_api/replication/batch/{id}          extend batch
//! DELETE /_api/replication/batch/{id}          finish batch
//! GET    /_api/replication/inventory           collections, indexes, views
//! PUT    /_api/replication/dump                chunked document dump
//! POST   /_api/replication/keys                key listing (async job)
//! PUT    /_api/job/{id}                        poll async job
//! PUT    /_api/replication/keys/{id}           keys / docs of a listing
//! DELETE /_api/replication/keys/{id}           release listing
//! GET    /_api/replication/revisions/tree      serialized revision tree
//! PUT    /_api/replication/revisions/ranges    revisions per range
//! PUT    /_api/replication/revisions/documents documents by revision
//! GET    /_api/wal/tail                        WAL markers
//! ```
//!
//! Chunk metadata travels in `replication-*` response headers; a missing or
//! unparsable header is a protocol error, never retried.

use crate::circuit_breaker::{CircuitConfig, CircuitError, LeaderCircuit};
use crate::config::{Credentials, ReplicationConfiguration};
use crate::error::{ReplicationError, Result};
use crate::job::{AbortSignal, POLL_INTERVAL};
use crate::metrics;
use crate::resilience::{RateLimiter, RetryConfig};
use crate::revision::{RevisionId, RevisionRange};
use crate::revision_tree::RevisionTree;
use crate::storage::{CollectionSpec, Document, IndexSpec, ViewSpec};
use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Boxed future returned by [`LeaderClient`] methods.
pub type LeaderFuture<'a, T> = BoxFuture<'a, Result<T>>;

pub const HEADER_CHECK_MORE: &str = "replication-checkmore";
pub const HEADER_LAST_INCLUDED: &str = "replication-lastincluded";
pub const HEADER_LAST_SCANNED: &str = "replication-lastscanned";
pub const HEADER_LAST_TICK: &str = "replication-lasttick";
pub const HEADER_FROM_PRESENT: &str = "replication-frompresent";
pub const HEADER_ASYNC_ID: &str = "x-arango-async-id";

/// Leaders older than this cannot serve revision trees.
pub const REVISION_TREE_MIN_VERSION: (u32, u32, u32) = (3, 8, 0);

/// Ticks are sent as decimal strings; older leaders send numbers.
pub(crate) mod tick_format {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tick: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&tick.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }
        match Raw::deserialize(d)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid tick {s:?}"))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity and version of the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub server_id: String,
    pub engine: String,
    pub version: (u32, u32, u32),
}

impl LeaderInfo {
    /// Parse `"3.11.4"`, `"3.12.0-devel"` and the like.
    pub fn parse_version(raw: &str) -> Option<(u32, u32, u32)> {
        let mut parts = raw.split('.').map(|p| {
            let digits: String = p.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u32>().ok()
        });
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some((major, minor, patch))
    }

    pub fn supports_revision_tree(&self) -> bool {
        self.version >= REVISION_TREE_MIN_VERSION
    }
}

/// A leader-side snapshot handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderBatch {
    pub id: String,
    /// WAL tick the snapshot was taken at; tailing starts here.
    #[serde(with = "tick_format")]
    pub last_tick: u64,
}

/// One collection in the leader inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryCollection {
    pub parameters: CollectionSpec,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

/// Leader declarations of collections, indexes and views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub collections: Vec<InventoryCollection>,
    #[serde(default)]
    pub views: Vec<ViewSpec>,
}

impl Inventory {
    pub fn collection(&self, name: &str) -> Option<&InventoryCollection> {
        self.collections.iter().find(|c| c.parameters.name == name)
    }

    pub fn collection_by_guid(&self, guid: &str) -> Option<&InventoryCollection> {
        if guid.is_empty() {
            return None;
        }
        self.collections.iter().find(|c| c.parameters.guid == guid)
    }
}

/// One page of a raw dump.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DumpChunk {
    pub documents: Vec<Document>,
    pub check_more: bool,
    /// Cursor to pass as `from` for the next page.
    pub last_included: u64,
}

/// A leader-side key listing produced by an async job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyListing {
    pub id: String,
    pub collection: String,
    pub count: u64,
}

/// `(key, revision)` as returned by key listings.
pub type KeyRevision = (String, RevisionId);

/// Revisions the leader holds in each requested range.
///
/// `ranges[i]` answers the i-th requested range. If `resume` is set the
/// answer was truncated: the last list stops just before `resume`, and
/// ranges after it were not answered at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangesResponse {
    pub ranges: Vec<Vec<RevisionId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<RevisionId>,
}

/// WAL marker type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum MarkerType {
    CollectionCreate,
    CollectionDrop,
    CollectionRename,
    CollectionChange,
    CollectionTruncate,
    IndexCreate,
    IndexDrop,
    ViewCreate,
    ViewDrop,
    ViewChange,
    TransactionStart,
    TransactionCommit,
    TransactionAbort,
    Document,
    Remove,
}

impl TryFrom<u16> for MarkerType {
    type Error = String;

    fn try_from(code: u16) -> std::result::Result<Self, Self::Error> {
        Ok(match code {
            2000 => Self::CollectionCreate,
            2001 => Self::CollectionDrop,
            2002 => Self::CollectionRename,
            2003 => Self::CollectionChange,
            2004 => Self::CollectionTruncate,
            2100 => Self::IndexCreate,
            2101 => Self::IndexDrop,
            2110 => Self::ViewCreate,
            2111 => Self::ViewDrop,
            2112 => Self::ViewChange,
            2200 => Self::TransactionStart,
            2201 => Self::TransactionCommit,
            2202 => Self::TransactionAbort,
            2300 => Self::Document,
            2302 => Self::Remove,
            other => return Err(format!("unknown marker type {other}")),
        })
    }
}

impl From<MarkerType> for u16 {
    fn from(t: MarkerType) -> Self {
        match t {
            MarkerType::CollectionCreate => 2000,
            MarkerType::CollectionDrop => 2001,
            MarkerType::CollectionRename => 2002,
            MarkerType::CollectionChange => 2003,
            MarkerType::CollectionTruncate => 2004,
            MarkerType::IndexCreate => 2100,
            MarkerType::IndexDrop => 2101,
            MarkerType::ViewCreate => 2110,
            MarkerType::ViewDrop => 2111,
            MarkerType::ViewChange => 2112,
            MarkerType::TransactionStart => 2200,
            MarkerType::TransactionCommit => 2201,
            MarkerType::TransactionAbort => 2202,
            MarkerType::Document => 2300,
            MarkerType::Remove => 2302,
        }
    }
}

impl MarkerType {
    pub fn is_data(self) -> bool {
        matches!(self, Self::Document | Self::Remove)
    }
}

/// One entry of the leader's write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalMarker {
    #[serde(with = "tick_format")]
    pub tick: u64,
    #[serde(rename = "type")]
    pub kind: MarkerType,
    /// Transaction id; `"0"` or absent outside transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    /// Collection globally unique id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuid: Option<String>,
    /// Collection name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl WalMarker {
    pub fn transaction_id(&self) -> Option<&str> {
        self.tid.as_deref().filter(|t| !t.is_empty() && *t != "0")
    }
}

/// One response of the WAL tail endpoint.
///
/// Markers have ticks strictly greater than the requested `from`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalChunk {
    pub markers: Vec<WalMarker>,
    pub check_more: bool,
    /// Tick of the last marker returned.
    pub last_included: u64,
    /// Last tick the leader looked at (may exceed `last_included` when
    /// filtered markers were skipped).
    pub last_scanned: u64,
    /// Newest tick in the leader WAL.
    pub last_tick: u64,
    /// Whether `from` was still present in the leader WAL.
    pub from_present: bool,
}

impl WalChunk {
    /// Position to continue from.
    pub fn next_from(&self, requested_from: u64) -> u64 {
        requested_from.max(self.last_included).max(self.last_scanned)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// The trait
// ═══════════════════════════════════════════════════════════════════════════════

/// What the syncers need from the leader.
pub trait LeaderClient: Send + Sync + 'static {
    fn leader_info(&self) -> LeaderFuture<'_, LeaderInfo>;

    fn start_batch(&self, ttl: Duration) -> LeaderFuture<'_, LeaderBatch>;

    fn extend_batch(&self, batch_id: &str, ttl: Duration) -> LeaderFuture<'_, ()>;

    fn finish_batch(&self, batch_id: &str) -> LeaderFuture<'_, ()>;

    /// Inventory of the database, or of one collection.
    fn inventory(&self, batch_id: &str, collection: Option<&str>) -> LeaderFuture<'_, Inventory>;

    fn dump(&self, collection: &str, batch_id: &str, from: u64, chunk_size: u64) -> LeaderFuture<'_, DumpChunk>;

    /// Start a key listing and wait for the leader's async job to produce it.
    fn create_key_listing(&self, collection: &str, batch_id: &str) -> LeaderFuture<'_, KeyListing>;

    /// Sorted `(key, rev)` pairs `offset..offset + limit` of a listing.
    fn listing_keys(&self, listing: &KeyListing, offset: u64, limit: u64) -> LeaderFuture<'_, Vec<KeyRevision>>;

    fn listing_documents(&self, listing: &KeyListing, keys: &[String]) -> LeaderFuture<'_, Vec<Document>>;

    fn release_key_listing(&self, listing: &KeyListing) -> LeaderFuture<'_, ()>;

    fn revision_tree(&self, collection: &str, batch_id: &str) -> LeaderFuture<'_, RevisionTree>;

    fn revision_ranges(
        &self,
        collection: &str,
        batch_id: &str,
        ranges: &[RevisionRange],
        resume: Option<RevisionId>,
    ) -> LeaderFuture<'_, RangesResponse>;

    /// Documents for `revisions`; revisions the leader no longer holds are
    /// silently missing from the result.
    fn revision_documents(
        &self,
        collection: &str,
        batch_id: &str,
        revisions: &[RevisionId],
    ) -> LeaderFuture<'_, Vec<Document>>;

    fn tail_wal(&self, from: u64, chunk_size: u64, collection: Option<&str>) -> LeaderFuture<'_, WalChunk>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Response parsing
// ═══════════════════════════════════════════════════════════════════════════════

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Result<&'h str> {
    headers
        .get(name)
        .ok_or_else(|| ReplicationError::protocol(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| ReplicationError::protocol(format!("non-ASCII {name} header")))
}

pub(crate) fn header_bool(headers: &HeaderMap, name: &str) -> Result<bool> {
    match header_str(headers, name)? {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ReplicationError::protocol(format!("{name}: expected bool, got {other:?}"))),
    }
}

pub(crate) fn header_u64(headers: &HeaderMap, name: &str) -> Result<u64> {
    let raw = header_str(headers, name)?;
    raw.parse()
        .map_err(|_| ReplicationError::protocol(format!("{name}: expected tick, got {raw:?}")))
}

fn optional_header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>> {
    if headers.contains_key(name) {
        header_u64(headers, name).map(Some)
    } else {
        Ok(None)
    }
}

/// Newline-delimited JSON. Blank lines are ignored.
pub(crate) fn parse_ndjson<T: DeserializeOwned>(body: &[u8]) -> Result<Vec<T>> {
    body.split(|b| *b == b'\n')
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .map(|line| serde_json::from_slice(line).map_err(ReplicationError::from))
        .collect()
}

pub(crate) fn parse_dump_chunk(headers: &HeaderMap, body: &[u8]) -> Result<DumpChunk> {
    Ok(DumpChunk {
        check_more: header_bool(headers, HEADER_CHECK_MORE)?,
        last_included: header_u64(headers, HEADER_LAST_INCLUDED)?,
        documents: parse_ndjson(body)?,
    })
}

pub(crate) fn parse_wal_chunk(headers: &HeaderMap, body: &[u8]) -> Result<WalChunk> {
    let last_included = header_u64(headers, HEADER_LAST_INCLUDED)?;
    Ok(WalChunk {
        check_more: header_bool(headers, HEADER_CHECK_MORE)?,
        last_included,
        last_scanned: optional_header_u64(headers, HEADER_LAST_SCANNED)?.unwrap_or(last_included),
        last_tick: header_u64(headers, HEADER_LAST_TICK)?,
        from_present: header_bool(headers, HEADER_FROM_PRESENT)?,
        markers: parse_ndjson(body)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
enum Channel {
    Control,
    Data,
}

/// One request, built fluently.
struct Call {
    channel: Channel,
    method: Method,
    path: String,
    query: Vec<(&'static str, String)>,
    body: Option<Value>,
    store_async: bool,
}

impl Call {
    fn control(method: Method, path: impl Into<String>) -> Self {
        Self::new(Channel::Control, method, path)
    }

    fn data(method: Method, path: impl Into<String>) -> Self {
        Self::new(Channel::Data, method, path)
    }

    fn new(channel: Channel, method: Method, path: impl Into<String>) -> Self {
        Self {
            channel,
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            store_async: false,
        }
    }

    fn query(mut self, key: &'static str, value: impl ToString) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    fn store_async(mut self) -> Self {
        self.store_async = true;
        self
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "errorNum", default)]
    error_num: u32,
    #[serde(rename = "errorMessage", default)]
    error_message: String,
}

/// Leader error number for an unknown collection.
const ERROR_COLLECTION_NOT_FOUND: u32 = 1203;

/// `reqwest` based [`LeaderClient`].
pub struct HttpLeaderClient {
    config: Arc<ReplicationConfiguration>,
    http: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
    circuit: LeaderCircuit,
    limiter: RateLimiter,
    abort: AbortSignal,
}

impl std::fmt::Debug for HttpLeaderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLeaderClient")
            .field("base_url", &self.base_url)
            .field("circuit", &self.circuit)
            .finish()
    }
}

impl HttpLeaderClient {
    pub fn new(config: Arc<ReplicationConfiguration>, abort: AbortSignal) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ReplicationError::Config(format!("cannot build HTTP client: {e}")))?;
        let base_url = format!(
            "{}/_db/{}",
            config.endpoint.trim_end_matches('/'),
            config.database
        );

        let leader = &config.leader;
        let control = CircuitConfig {
            failure_threshold: leader.circuit_failure_threshold,
            recovery_timeout: leader.circuit_reset_timeout(),
            ..CircuitConfig::lenient()
        };
        let data = CircuitConfig {
            failure_threshold: leader.circuit_failure_threshold,
            recovery_timeout: leader.circuit_reset_timeout(),
            ..CircuitConfig::default()
        };

        Ok(Self {
            http,
            base_url,
            retry: leader.retry(),
            circuit: LeaderCircuit::new(control, data),
            limiter: RateLimiter::new(leader.rate_limit.clone()),
            abort,
            config,
        })
    }

    pub fn circuit(&self) -> &LeaderCircuit {
        &self.circuit
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.credentials {
            Credentials::None => req,
            Credentials::Basic { username, password } => req.basic_auth(username, Some(password)),
            Credentials::Jwt { token } => req.bearer_auth(token),
        }
    }

    async fn client_error(path: &str, resp: Response) -> ReplicationError {
        let status = resp.status();
        let body: Option<ErrorBody> = resp.json().await.ok();
        match body {
            Some(b) if b.error_num == ERROR_COLLECTION_NOT_FOUND => {
                ReplicationError::CollectionNotFound(b.error_message)
            }
            Some(b) => ReplicationError::protocol(format!(
                "{path}: HTTP {status}: {} ({})",
                b.error_message, b.error_num
            )),
            None => ReplicationError::protocol(format!("{path}: HTTP {status}")),
        }
    }

    /// Send one request with retries, breaker and rate limit.
    ///
    /// 5xx and 429 are transport failures; other 4xx are protocol errors and
    /// do not count against the breaker.
    async fn send(&self, call: Call) -> Result<Response> {
        let breaker = match call.channel {
            Channel::Control => &self.circuit.control,
            Channel::Data => &self.circuit.data,
        };
        let url = format!("{}{}", self.base_url, call.path);
        let path = call.path.as_str();
        let mut attempt = 0;

        loop {
            self.abort.check()?;
            attempt += 1;
            self.limiter.acquire().await;
            let started = Instant::now();

            let outcome = breaker
                .call(|| async {
                    let mut req = self
                        .authorize(self.http.request(call.method.clone(), &url))
                        .query(&call.query);
                    if call.store_async {
                        req = req.header("x-arango-async", "store");
                    }
                    if let Some(body) = &call.body {
                        req = req.json(body);
                    }
                    let resp = req.send().await.map_err(ReplicationError::from)?;
                    let status = resp.status();
                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(ReplicationError::transport(path, format!("HTTP {status}")));
                    }
                    if status.is_client_error() {
                        return Ok(Err(Self::client_error(path, resp).await));
                    }
                    Ok::<Result<Response>, ReplicationError>(Ok(resp))
                })
                .await;

            let result = match outcome {
                Ok(inner) => inner,
                Err(CircuitError::Rejected) => Err(ReplicationError::transport(path, "circuit open")),
                Err(CircuitError::Inner(e)) => Err(e),
            };
            metrics::record_leader_request(path, result.is_ok(), started.elapsed());

            match result {
                Err(e) if e.is_retryable() && self.retry.allows(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        endpoint = %path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Leader request failed, retrying"
                    );
                    metrics::record_leader_retry(path);
                    self.abort.sleep(delay).await?;
                }
                other => return other,
            }
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, call: Call) -> Result<T> {
        let resp = self.send(call).await?;
        Ok(resp.json().await?)
    }

    async fn fetch_leader_info(&self) -> Result<LeaderInfo> {
        let version: Value = self
            .send_json(Call::control(Method::GET, "/_api/version").query("details", true))
            .await?;
        let raw_version = version
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| ReplicationError::protocol("version response without version"))?;
        let parsed = LeaderInfo::parse_version(raw_version)
            .ok_or_else(|| ReplicationError::protocol(format!("unparsable version {raw_version:?}")))?;
        let engine = version
            .pointer("/details/engine")
            .and_then(Value::as_str)
            .unwrap_or("rocksdb")
            .to_string();

        let state: Value = self
            .send_json(Call::control(Method::GET, "/_api/replication/logger-state"))
            .await?;
        let server_id = state
            .pointer("/server/serverId")
            .and_then(Value::as_str)
            .ok_or_else(|| ReplicationError::protocol("logger-state without server.serverId"))?
            .to_string();

        Ok(LeaderInfo {
            server_id,
            engine,
            version: parsed,
        })
    }

    async fn fetch_key_listing(&self, collection: String, batch_id: String) -> Result<KeyListing> {
        #[derive(Deserialize)]
        struct ListingBody {
            id: String,
            #[serde(default, with = "tick_format")]
            count: u64,
        }

        let resp = self
            .send(
                Call::data(Method::POST, "/_api/replication/keys")
                    .query("collection", &collection)
                    .query("batchId", &batch_id)
                    .query("serverId", &self.config.server_id)
                    .store_async(),
            )
            .await?;
        let job_id = header_str(resp.headers(), HEADER_ASYNC_ID)?.to_string();
        let deadline = Instant::now() + self.config.initial_sync_max_wait();
        debug!(collection = %collection, job_id = %job_id, "Waiting for key listing job");

        loop {
            let resp = self
                .send(Call::control(Method::PUT, format!("/_api/job/{job_id}")))
                .await?;
            if resp.status() == StatusCode::NO_CONTENT {
                if Instant::now() >= deadline {
                    return Err(ReplicationError::transport(
                        "/_api/job",
                        format!("key listing job {job_id} for {collection} still pending"),
                    ));
                }
                self.abort.sleep(POLL_INTERVAL).await?;
                continue;
            }
            let body: ListingBody = resp.json().await?;
            return Ok(KeyListing {
                id: body.id,
                collection,
                count: body.count,
            });
        }
    }
}

impl LeaderClient for HttpLeaderClient {
    fn leader_info(&self) -> LeaderFuture<'_, LeaderInfo> {
        Box::pin(self.fetch_leader_info())
    }

    fn start_batch(&self, ttl: Duration) -> LeaderFuture<'_, LeaderBatch> {
        Box::pin(async move {
            let batch: LeaderBatch = self
                .send_json(
                    Call::control(Method::POST, "/_api/replication/batch")
                        .query("serverId", &self.config.server_id)
                        .json(json!({ "ttl": ttl.as_secs() })),
                )
                .await?;
            metrics::record_batch_event("start");
            Ok(batch)
        })
    }

    fn extend_batch(&self, batch_id: &str, ttl: Duration) -> LeaderFuture<'_, ()> {
        let path = format!("/_api/replication/batch/{batch_id}");
        Box::pin(async move {
            self.send(
                Call::control(Method::PUT, path)
                    .query("serverId", &self.config.server_id)
                    .json(json!({ "ttl": ttl.as_secs() })),
            )
            .await?;
            Ok(())
        })
    }

    fn finish_batch(&self, batch_id: &str) -> LeaderFuture<'_, ()> {
        let path = format!("/_api/replication/batch/{batch_id}");
        Box::pin(async move {
            self.send(Call::control(Method::DELETE, path).query("serverId", &self.config.server_id))
                .await?;
            Ok(())
        })
    }

    fn inventory(&self, batch_id: &str, collection: Option<&str>) -> LeaderFuture<'_, Inventory> {
        let mut call = Call::control(Method::GET, "/_api/replication/inventory")
            .query("serverId", &self.config.server_id)
            .query("batchId", batch_id)
            .query("includeSystem", self.config.include_system);
        if let Some(c) = collection {
            call = call.query("collection", c);
        }
        Box::pin(self.send_json(call))
    }

    fn dump(&self, collection: &str, batch_id: &str, from: u64, chunk_size: u64) -> LeaderFuture<'_, DumpChunk> {
        let call = Call::data(Method::PUT, "/_api/replication/dump")
            .query("collection", collection)
            .query("batchId", batch_id)
            .query("from", from)
            .query("chunkSize", chunk_size)
            .query("useEnvelope", false)
            .query("serverId", &self.config.server_id);
        Box::pin(async move {
            let resp = self.send(call).await?;
            let headers = resp.headers().clone();
            let body = resp.bytes().await?;
            parse_dump_chunk(&headers, &body)
        })
    }

    fn create_key_listing(&self, collection: &str, batch_id: &str) -> LeaderFuture<'_, KeyListing> {
        Box::pin(self.fetch_key_listing(collection.to_string(), batch_id.to_string()))
    }

    fn listing_keys(&self, listing: &KeyListing, offset: u64, limit: u64) -> LeaderFuture<'_, Vec<KeyRevision>> {
        let call = Call::data(Method::PUT, format!("/_api/replication/keys/{}", listing.id))
            .query("type", "keys")
            .query("collection", &listing.collection)
            .query("offset", offset)
            .query("chunkSize", limit)
            .query("serverId", &self.config.server_id);
        Box::pin(self.send_json(call))
    }

    fn listing_documents(&self, listing: &KeyListing, keys: &[String]) -> LeaderFuture<'_, Vec<Document>> {
        let call = Call::data(Method::PUT, format!("/_api/replication/keys/{}", listing.id))
            .query("type", "docs")
            .query("collection", &listing.collection)
            .query("serverId", &self.config.server_id)
            .json(json!(keys));
        Box::pin(self.send_json(call))
    }

    fn release_key_listing(&self, listing: &KeyListing) -> LeaderFuture<'_, ()> {
        let call = Call::control(Method::DELETE, format!("/_api/replication/keys/{}", listing.id))
            .query("serverId", &self.config.server_id);
        Box::pin(async move {
            self.send(call).await?;
            Ok(())
        })
    }

    fn revision_tree(&self, collection: &str, batch_id: &str) -> LeaderFuture<'_, RevisionTree> {
        let call = Call::data(Method::GET, "/_api/replication/revisions/tree")
            .query("collection", collection)
            .query("batchId", batch_id)
            .query("onlyPopulated", true)
            .query("serverId", &self.config.server_id);
        Box::pin(async move {
            let resp = self.send(call).await?;
            let body = resp.bytes().await?;
            RevisionTree::from_json_slice(&body)
        })
    }

    fn revision_ranges(
        &self,
        collection: &str,
        batch_id: &str,
        ranges: &[RevisionRange],
        resume: Option<RevisionId>,
    ) -> LeaderFuture<'_, RangesResponse> {
        let mut call = Call::data(Method::PUT, "/_api/replication/revisions/ranges")
            .query("collection", collection)
            .query("batchId", batch_id)
            .query("serverId", &self.config.server_id)
            .json(json!(ranges));
        if let Some(r) = resume {
            call = call.query("resume", r.to_hlc());
        }
        Box::pin(self.send_json(call))
    }

    fn revision_documents(
        &self,
        collection: &str,
        batch_id: &str,
        revisions: &[RevisionId],
    ) -> LeaderFuture<'_, Vec<Document>> {
        let call = Call::data(Method::PUT, "/_api/replication/revisions/documents")
            .query("collection", collection)
            .query("batchId", batch_id)
            .query("serverId", &self.config.server_id)
            .json(json!(revisions));
        Box::pin(self.send_json(call))
    }

    fn tail_wal(&self, from: u64, chunk_size: u64, collection: Option<&str>) -> LeaderFuture<'_, WalChunk> {
        let mut call = Call::data(Method::GET, "/_api/wal/tail")
            .query("from", from)
            .query("chunkSize", chunk_size)
            .query("serverId", &self.config.server_id)
            .query("includeSystem", self.config.include_system);
        if let Some(c) = collection {
            call = call.query("collection", c);
        }
        Box::pin(async move {
            let resp = self.send(call).await?;
            let headers = resp.headers().clone();
            let body = resp.bytes().await?;
            parse_wal_chunk(&headers, &body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(LeaderInfo::parse_version("3.11.4"), Some((3, 11, 4)));
        assert_eq!(LeaderInfo::parse_version("3.12.0-devel"), Some((3, 12, 0)));
        assert_eq!(LeaderInfo::parse_version("3.7"), Some((3, 7, 0)));
        assert_eq!(LeaderInfo::parse_version("devel"), None);
    }

    #[test]
    fn test_supports_revision_tree_threshold() {
        let mut info = LeaderInfo {
            server_id: "PRMR-1".into(),
            engine: "rocksdb".into(),
            version: (3, 7, 15),
        };
        assert!(!info.supports_revision_tree());
        info.version = (3, 8, 0);
        assert!(info.supports_revision_tree());
        info.version = (4, 0, 0);
        assert!(info.supports_revision_tree());
    }

    #[test]
    fn test_parse_dump_chunk() {
        let h = headers(&[(HEADER_CHECK_MORE, "true"), (HEADER_LAST_INCLUDED, "77")]);
        let body = b"{\"_key\":\"a\",\"_rev\":\"_b\",\"x\":1}\n\n{\"_key\":\"b\",\"_rev\":\"_c\"}\n";
        let chunk = parse_dump_chunk(&h, body).unwrap();
        assert!(chunk.check_more);
        assert_eq!(chunk.last_included, 77);
        assert_eq!(chunk.documents.len(), 2);
        assert_eq!(chunk.documents[0].key, "a");
    }

    #[test]
    fn test_missing_header_is_protocol_error() {
        let h = headers(&[(HEADER_LAST_INCLUDED, "1")]);
        let err = parse_dump_chunk(&h, b"").unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol(ref m) if m.contains(HEADER_CHECK_MORE)));
        assert!(!err.is_retryable());

        let h = headers(&[(HEADER_CHECK_MORE, "yes"), (HEADER_LAST_INCLUDED, "1")]);
        assert!(parse_dump_chunk(&h, b"").is_err());
    }

    #[test]
    fn test_parse_wal_chunk() {
        let h = headers(&[
            (HEADER_CHECK_MORE, "false"),
            (HEADER_LAST_INCLUDED, "120"),
            (HEADER_LAST_TICK, "500"),
            (HEADER_FROM_PRESENT, "true"),
        ]);
        let body = br#"{"tick":"110","type":2300,"cname":"c","data":{"_key":"a","_rev":"_b"}}
{"tick":"120","type":2302,"tid":"0","cname":"c","data":{"_key":"a","_rev":"_c"}}"#;
        let chunk = parse_wal_chunk(&h, body).unwrap();
        assert_eq!(chunk.markers.len(), 2);
        assert_eq!(chunk.markers[0].kind, MarkerType::Document);
        assert_eq!(chunk.markers[1].kind, MarkerType::Remove);
        assert_eq!(chunk.markers[1].transaction_id(), None);
        // lastscanned absent: falls back to lastincluded
        assert_eq!(chunk.last_scanned, 120);
        assert_eq!(chunk.last_tick, 500);
        assert_eq!(chunk.next_from(100), 120);
    }

    #[test]
    fn test_unknown_marker_type_rejected() {
        let line = br#"{"tick":"1","type":9999}"#;
        assert!(parse_ndjson::<WalMarker>(line).is_err());
    }

    #[test]
    fn test_marker_transaction_id() {
        let m: WalMarker = serde_json::from_str(r#"{"tick":5,"type":2200,"tid":"42"}"#).unwrap();
        assert_eq!(m.kind, MarkerType::TransactionStart);
        assert_eq!(m.transaction_id(), Some("42"));
        assert!(!m.kind.is_data());
    }

    #[test]
    fn test_batch_and_inventory_shapes() {
        let batch: LeaderBatch = serde_json::from_str(r#"{"id":"123","lastTick":"9000"}"#).unwrap();
        assert_eq!(batch.last_tick, 9000);

        let inv: Inventory = serde_json::from_value(serde_json::json!({
            "collections": [{
                "parameters": {"id": "10", "globallyUniqueId": "h1/10", "name": "users", "type": 2},
                "indexes": [{"id": "20", "type": "persistent", "fields": ["email"], "unique": true}]
            }],
            "views": [{"id": "30", "name": "v", "type": "arangosearch", "properties": {}}]
        }))
        .unwrap();
        assert_eq!(inv.collection("users").unwrap().indexes.len(), 1);
        assert!(inv.collection_by_guid("h1/10").is_some());
        assert!(inv.collection_by_guid("").is_none());
    }

    #[test]
    fn test_ranges_response_resume() {
        let r: RangesResponse =
            serde_json::from_str(r#"{"ranges":[["_b","_c"],[]],"resume":"_d"}"#).unwrap();
        assert_eq!(r.ranges[0].len(), 2);
        assert!(r.ranges[1].is_empty());
        assert!(r.resume.is_some());
    }

    #[tokio::test]
    async fn test_client_builds_base_url() {
        let config = Arc::new(ReplicationConfiguration {
            endpoint: "http://leader:8529/".into(),
            database: "shop".into(),
            ..ReplicationConfiguration::for_testing("f1")
        });
        let client = HttpLeaderClient::new(config, AbortSignal::new()).unwrap();
        assert_eq!(client.base_url, "http://leader:8529/_db/shop");
    }

    #[tokio::test]
    async fn test_unreachable_leader_is_transport_error() {
        let config = Arc::new(ReplicationConfiguration {
            endpoint: "http://127.0.0.1:9".into(),
            connect_timeout: "100ms".into(),
            ..ReplicationConfiguration::for_testing("f1")
        });
        let client = HttpLeaderClient::new(config, AbortSignal::new()).unwrap();
        let err = client.leader_info().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Transport { .. }));
    }
}
