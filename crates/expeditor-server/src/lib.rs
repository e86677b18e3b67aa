use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use expeditor_config::Config;
use expeditor_contracts::{
    rpc_error, rpc_result, tool_definitions, FieldViolation, Method, RpcError, SERVICE_NAME,
    SERVICE_VERSION, METHOD_ACCEPT_ORDER, METHOD_EXPORT_MENU, METHOD_VALIDATE_ORDER, RPC_VERSION,
};
use expeditor_kernel::{
    parse_envelope, validate_menu_export, validate_order_accept, validate_order_validate,
    RpcRequest, MIN_REF_LEN,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const REPLAY_HEADER: &str = "x-idempotency-replay";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// Spelling used by the FoodTec backend for the same signal.
const UPSTREAM_REPLAY_HEADER: &str = "x-idempotent-replayed";

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "expeditor gateway listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(&cfg)?;

    let sweep_every = Duration::from_millis(cfg.idempotency.sweep_interval_ms);
    tokio::spawn(sweep_task(
        Arc::downgrade(&state.ledger),
        Arc::downgrade(&state.menu_cache),
        sweep_every,
    ));

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/tools", get(tools))
        .route("/rpc", post(rpc))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    ledger: Arc<IdempotencyLedger>,
    menu_cache: Arc<MenuCache>,
    upstream: Arc<UpstreamClient>,
}

impl AppState {
    fn new(cfg: &Config) -> Result<Self, String> {
        Ok(Self {
            ledger: Arc::new(IdempotencyLedger::new(
                Duration::from_millis(cfg.idempotency.ttl_ms),
                cfg.idempotency.record_failures,
            )),
            menu_cache: Arc::new(MenuCache::new(Duration::from_millis(cfg.menu_cache.ttl_ms))),
            upstream: Arc::new(UpstreamClient::new(
                &cfg.upstream.rpc_url,
                Duration::from_millis(cfg.upstream.timeout_ms),
            )?),
        })
    }

    async fn handle_request(&self, body: Value, header_idem: Option<&str>) -> Handled {
        let req = match parse_envelope(&body) {
            Ok(req) => req,
            Err(violations) => {
                return Handled::error(Value::Null, RpcError::invalid_request(violations));
            }
        };

        let Some(method) = Method::from_name(&req.method) else {
            warn!(method = %req.method, "rejected unrecognized method");
            return Handled::error(req.id, RpcError::method_not_found(&req.method));
        };

        match self.dispatch(method, &req, header_idem).await {
            Ok(done) => {
                info!(method = method.name(), replayed = done.replayed, "rpc ok");
                Handled {
                    envelope: rpc_result(&req.id, done.payload),
                    replayed: done.replayed,
                    idem: done.idem,
                }
            }
            Err(err) => {
                warn!(method = method.name(), code = err.code, %err, "rpc failed");
                Handled::error(req.id, err)
            }
        }
    }

    /// The one place that decides which of cache / ledger / upstream a
    /// method touches. Anything unanticipated is mapped to an internal
    /// error by the caller rather than escaping the request.
    async fn dispatch(
        &self,
        method: Method,
        req: &RpcRequest,
        header_idem: Option<&str>,
    ) -> Result<Dispatched, RpcError> {
        match method {
            Method::ListTools => Ok(Dispatched::plain(json!({ "tools": tool_definitions() }))),
            Method::ExportMenu => {
                let params = validate_menu_export(&req.params).map_err(RpcError::invalid_params)?;
                let upstream = Arc::clone(&self.upstream);
                let forwarded = json!({ "store_id": params.store_id });
                let payload = self
                    .menu_cache
                    .get_or_fetch(&params.store_id, move || async move {
                        upstream
                            .call(METHOD_EXPORT_MENU, forwarded, None)
                            .await
                            .map(|reply| reply.payload)
                    })
                    .await?;
                Ok(Dispatched::plain(payload))
            }
            Method::ValidateOrder => {
                validate_order_validate(&req.params).map_err(RpcError::invalid_params)?;
                let reply = self
                    .upstream
                    .call(
                        METHOD_VALIDATE_ORDER,
                        Value::Object(req.params.clone()),
                        None,
                    )
                    .await?;
                Ok(Dispatched {
                    payload: reply.payload,
                    replayed: reply.replayed,
                    idem: None,
                })
            }
            Method::AcceptOrder => {
                let params = validate_order_accept(&req.params).map_err(RpcError::invalid_params)?;
                let forwarded = Value::Object(req.params.clone());

                // Explicit params key wins over the request header. A header
                // key is held to the same length rule as params.idem, so a
                // degenerate header can never collide unrelated orders.
                let key = match params.idem {
                    Some(key) => Some(key),
                    None => match header_idem {
                        None => None,
                        Some(h) if h.len() >= MIN_REF_LEN => Some(h.to_string()),
                        Some(h) => {
                            return Err(RpcError::invalid_params(vec![FieldViolation::new(
                                "Idempotency-Key",
                                format!(
                                    "Idempotency-Key header must be a string of at least {MIN_REF_LEN} characters"
                                ),
                                json!(h),
                            )]));
                        }
                    },
                };
                let Some(key) = key else {
                    let reply = self
                        .upstream
                        .call(METHOD_ACCEPT_ORDER, forwarded, None)
                        .await?;
                    return Ok(Dispatched {
                        payload: reply.payload,
                        replayed: reply.replayed,
                        idem: None,
                    });
                };

                let upstream = Arc::clone(&self.upstream);
                let call_key = key.clone();
                // The upstream may report its own replay (its dedup window can
                // outlive this ledger's); that signal reaches the caller too.
                let upstream_replayed = Arc::new(AtomicBool::new(false));
                let seen_replay = Arc::clone(&upstream_replayed);
                let (outcome, ledger_replayed) = self
                    .ledger
                    .accept(&key, move || async move {
                        upstream
                            .call(METHOD_ACCEPT_ORDER, forwarded, Some(&call_key))
                            .await
                            .map(|reply| {
                                if reply.replayed {
                                    seen_replay.store(true, Ordering::Relaxed);
                                }
                                reply.payload
                            })
                    })
                    .await;
                let replayed = ledger_replayed || upstream_replayed.load(Ordering::Relaxed);
                if replayed {
                    info!(idem = %key, "idempotent replay");
                }
                let payload = outcome?;
                Ok(Dispatched {
                    payload,
                    replayed,
                    idem: Some(key),
                })
            }
        }
    }
}

struct Dispatched {
    payload: Value,
    replayed: bool,
    idem: Option<String>,
}

impl Dispatched {
    fn plain(payload: Value) -> Self {
        Self {
            payload,
            replayed: false,
            idem: None,
        }
    }
}

struct Handled {
    envelope: Value,
    replayed: bool,
    idem: Option<String>,
}

impl Handled {
    fn error(id: Value, err: RpcError) -> Self {
        Self {
            envelope: rpc_error(&id, &err),
            replayed: false,
            idem: None,
        }
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({
        "ok": true,
        "ts": chrono::Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn tools() -> Json<Value> {
    Json(json!({ "tools": tool_definitions() }))
}

async fn rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let header_idem = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (payload, replayed, idem) = match body {
        Value::Array(items) if items.is_empty() => {
            let err = RpcError::invalid_request(vec![FieldViolation::new(
                "",
                "batch must not be empty",
                json!([]),
            )]);
            (rpc_error(&Value::Null, &err), false, None)
        }
        Value::Array(items) => {
            let mut envelopes = Vec::with_capacity(items.len());
            let mut any_replay = false;
            let mut idem = None;
            for item in items {
                let handled = state.handle_request(item, header_idem.as_deref()).await;
                any_replay |= handled.replayed;
                if handled.idem.is_some() {
                    idem = handled.idem;
                }
                envelopes.push(handled.envelope);
            }
            (Value::Array(envelopes), any_replay, idem)
        }
        single => {
            let handled = state.handle_request(single, header_idem.as_deref()).await;
            (handled.envelope, handled.replayed, handled.idem)
        }
    };

    let mut response = (StatusCode::OK, Json(payload)).into_response();
    if replayed {
        response
            .headers_mut()
            .insert(REPLAY_HEADER, HeaderValue::from_static("true"));
    }
    if let Some(key) = idem {
        if let Ok(value) = HeaderValue::from_str(&key) {
            response.headers_mut().insert(IDEMPOTENCY_KEY_HEADER, value);
        }
    }
    response
}

async fn sweep_task(ledger: Weak<IdempotencyLedger>, cache: Weak<MenuCache>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let (Some(ledger), Some(cache)) = (ledger.upgrade(), cache.upgrade()) else {
            return;
        };
        let evicted = ledger.sweep_expired() + cache.sweep_expired();
        if evicted > 0 {
            debug!(evicted, "swept expired entries");
        }
    }
}

type AcceptOutcome = Result<Value, RpcError>;

/// Maps an idempotency key to the response recorded for it, with a
/// single-flight guarantee: while a first attempt for a key is in flight,
/// duplicates wait on its outcome instead of calling upstream again.
pub struct IdempotencyLedger {
    ttl: Duration,
    record_failures: bool,
    entries: Mutex<HashMap<String, LedgerSlot>>,
}

enum LedgerSlot {
    InFlight(watch::Receiver<Option<AcceptOutcome>>),
    Done(LedgerEntry),
}

struct LedgerEntry {
    created: Instant,
    response: AcceptOutcome,
}

impl IdempotencyLedger {
    pub fn new(ttl: Duration, record_failures: bool) -> Self {
        Self {
            ttl,
            record_failures,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the recorded or freshly computed outcome plus a replay flag.
    /// `call` runs at most once per live key across all concurrent callers.
    pub async fn accept<F, Fut>(&self, key: &str, call: F) -> (AcceptOutcome, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AcceptOutcome>,
    {
        let mut call = Some(call);
        loop {
            enum Role {
                Claimed(watch::Sender<Option<AcceptOutcome>>),
                Waiting(watch::Receiver<Option<AcceptOutcome>>),
            }

            let role = {
                let mut entries = self.lock_entries();
                match entries.get(key) {
                    Some(LedgerSlot::Done(entry)) if entry.created.elapsed() < self.ttl => {
                        return (entry.response.clone(), true);
                    }
                    Some(LedgerSlot::Done(_)) => {
                        // Stale: a textually identical key is a fresh request.
                        entries.remove(key);
                        let (tx, rx) = watch::channel(None);
                        entries.insert(key.to_string(), LedgerSlot::InFlight(rx));
                        Role::Claimed(tx)
                    }
                    Some(LedgerSlot::InFlight(rx)) => Role::Waiting(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        entries.insert(key.to_string(), LedgerSlot::InFlight(rx));
                        Role::Claimed(tx)
                    }
                }
            };

            match role {
                Role::Claimed(tx) => {
                    let Some(call) = call.take() else {
                        return (
                            Err(RpcError::internal("idempotency claim retried after use")),
                            false,
                        );
                    };
                    // Releases the claim if this future is dropped mid-call,
                    // so a timed-out attempt never poisons the key.
                    let mut claim = ClaimGuard {
                        ledger: self,
                        key,
                        armed: true,
                    };

                    let outcome = call().await;

                    {
                        let mut entries = self.lock_entries();
                        if outcome.is_ok() || self.record_failures {
                            entries.insert(
                                key.to_string(),
                                LedgerSlot::Done(LedgerEntry {
                                    created: Instant::now(),
                                    response: outcome.clone(),
                                }),
                            );
                        } else {
                            entries.remove(key);
                        }
                    }
                    claim.armed = false;
                    let _ = tx.send(Some(outcome.clone()));
                    return (outcome, false);
                }
                Role::Waiting(mut rx) => {
                    match rx.wait_for(|v| v.is_some()).await {
                        Ok(value) => {
                            if let Some(outcome) = value.clone() {
                                return (outcome, true);
                            }
                        }
                        // First attempt was dropped without an outcome; the
                        // key is free again, so try to claim it ourselves.
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    /// Evicts expired recorded entries. In-flight claims are never touched.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, slot| match slot {
            LedgerSlot::InFlight(_) => true,
            LedgerSlot::Done(entry) => entry.created.elapsed() < self.ttl,
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, LedgerSlot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ClaimGuard<'a> {
    ledger: &'a IdempotencyLedger,
    key: &'a str,
    armed: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut entries = self.ledger.lock_entries();
        if matches!(entries.get(self.key), Some(LedgerSlot::InFlight(_))) {
            entries.remove(self.key);
        }
    }
}

/// Read-through cache for menu exports, keyed by store. Freshness is
/// best-effort: simultaneous cold misses for one key may both fetch, which
/// is tolerable because menu data is idempotent to re-fetch.
pub struct MenuCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    created: Instant,
    payload: Value,
}

impl MenuCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, store_key: &str, fetch: F) -> Result<Value, RpcError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, RpcError>>,
    {
        {
            let entries = self.lock_entries();
            if let Some(entry) = entries.get(store_key) {
                if entry.created.elapsed() < self.ttl {
                    return Ok(entry.payload.clone());
                }
            }
        }

        let payload = fetch().await?;
        let mut entries = self.lock_entries();
        entries.insert(
            store_key.to_string(),
            CacheEntry {
                created: Instant::now(),
                payload: payload.clone(),
            },
        );
        Ok(payload)
    }

    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.created.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct UpstreamReply {
    pub payload: Value,
    /// Set when the upstream reported its own idempotent replay.
    pub replayed: bool,
}

/// Forwards a JSON-RPC call to the order-management backend and normalizes
/// its response into either a payload or one of the gateway error classes.
pub struct UpstreamClient {
    client: reqwest::Client,
    rpc_url: String,
}

impl UpstreamClient {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("build upstream client failed: {e}"))?;
        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
        })
    }

    pub async fn call(
        &self,
        method: &str,
        params: Value,
        idem: Option<&str>,
    ) -> Result<UpstreamReply, RpcError> {
        let body = json!({
            "jsonrpc": RPC_VERSION,
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.rpc_url).json(&body);
        if let Some(key) = idem {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::transport(format!("upstream call timed out: {e}"))
            } else {
                RpcError::transport(format!("upstream unreachable: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let replayed = [REPLAY_HEADER, UPSTREAM_REPLAY_HEADER].iter().any(|name| {
            response
                .headers()
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        });

        let payload: Value = response.json().await.map_err(|e| {
            RpcError::upstream(
                "Upstream returned non-JSON payload",
                Some(json!({ "status": status, "detail": e.to_string() })),
            )
        })?;

        if payload.get("jsonrpc").and_then(Value::as_str) != Some(RPC_VERSION) {
            return Err(RpcError::upstream(
                "Upstream returned non-JSON-RPC payload",
                Some(json!({ "status": status, "body": payload })),
            ));
        }
        if let Some(err) = payload.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string();
            return Err(RpcError::upstream(
                message,
                Some(json!({
                    "upstreamCode": err.get("code").cloned().unwrap_or(Value::Null),
                    "upstreamData": err.get("data").cloned().unwrap_or(Value::Null),
                })),
            ));
        }
        match payload.get("result") {
            Some(result) => Ok(UpstreamReply {
                payload: result.clone(),
                replayed,
            }),
            None => Err(RpcError::upstream(
                "Upstream returned non-JSON-RPC payload",
                Some(json!({ "status": status, "body": payload })),
            )),
        }
    }
}
