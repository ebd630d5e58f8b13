//! Content HTTP API.
//!
//! Serves published content, search and external submissions as JSON.
//! Successful responses carry a top-level `data` array.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/{prefix}/contents?type&count&offset&order` | One page of a type, newest first by default |
//! | `GET`  | `/{prefix}/content?type&id` or `?slug` | One record |
//! | `GET`  | `/{prefix}/search?type&q&count&offset` | Full-text search within a type |
//! | `POST` | `/{prefix}/content/create?type` | External submission (form or multipart) |
//! | `POST` | `/{prefix}/content/update?type&id` | External update |
//! | `POST` | `/{prefix}/content/delete?type&id` | External delete |
//! | `GET`  | `/{prefix}/uploads/YYYY/MM/name` | Uploaded files |
//! | `GET`  | `/{prefix}/backup?source` | `tar.gz` backup, behind basic auth |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "content type 'Nope' not found" } }
//! ```
//!
//! Error codes: `bad_request` and `rejected` (400), `unauthorized` (401),
//! `forbidden` (403), `not_found` (404), `method_not_allowed` (405), `conflict` (409),
//! `internal` (500).
//!
//! # Layers
//!
//! Every API request is queued for analytics. `GET` responses carry the
//! settings ETag and `Cache-Control`, and a matching `If-None-Match` gets a
//! `304`. CORS allows any origin unless `cors_disabled` is set, in which
//! case only `domain` is allowed. Responses are gzipped unless
//! `gzip_disabled` is set. Backups skip the analytics and cache layers.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    extract::{ConnectInfo, FromRequest, Multipart, OriginalUri, Query, Request, State},
    http::{
        header, request::Parts, Extensions, HeaderMap, HeaderValue, Method, StatusCode, Version,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::compression::predicate::{DefaultPredicate, NotForContentType, Predicate};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;

use content_engine_core::analytics::RequestRecord;
use content_engine_core::entity::{HookContext, Record};
use content_engine_core::form::FormValues;
use content_engine_core::target::sorted_bucket;

use crate::analytics::Analytics;
use crate::backup::{BackupSource, Backups};
use crate::content::ContentService;
use crate::engine::Engine;
use crate::error::{EngineError, ErrorKind};
use crate::repository::{Order, QueryOptions, Repository};
use crate::settings::ConfigCache;
use crate::uploads::Storage;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    repo: Repository,
    content: ContentService,
    storage: Storage,
    settings: ConfigCache,
    analytics: Analytics,
    backups: Backups,
    api_prefix: String,
    uploads_dir: PathBuf,
}

impl AppState {
    pub fn new(engine: &Engine) -> Self {
        let uploads = &engine.config().uploads;
        Self {
            repo: engine.repo().clone(),
            content: engine.content().clone(),
            storage: engine.storage().clone(),
            settings: engine.settings().clone(),
            analytics: engine.analytics().clone(),
            backups: engine.backups().clone(),
            api_prefix: uploads.api_prefix.trim_matches('/').to_string(),
            uploads_dir: uploads.dir.clone(),
        }
    }
}

/// Builds the full router with every layer applied.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/contents", get(handle_contents))
        .route("/content", get(handle_content))
        .route("/search", get(handle_search))
        .route("/content/create", post(handle_create))
        .route("/content/update", post(handle_update))
        .route("/content/delete", post(handle_delete))
        .nest_service("/uploads", ServeDir::new(&state.uploads_dir))
        .layer(middleware::from_fn_with_state(state.clone(), cache_headers))
        .layer(middleware::from_fn_with_state(state.clone(), record_request));

    let cors_settings = state.settings.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| origin_allowed(&cors_settings, origin),
        ))
        .allow_methods(Any)
        .allow_headers(Any);

    let gzip_settings = state.settings.clone();
    let compression = CompressionLayer::new().compress_when(
        DefaultPredicate::new()
            .and(NotForContentType::const_new(BACKUP_CONTENT_TYPE))
            .and(
                move |_: StatusCode, _: Version, _: &HeaderMap, _: &Extensions| {
                    !gzip_settings.flag("gzip_disabled")
                },
            ),
    );

    Router::new()
        .nest(&format!("/{}", state.api_prefix), api)
        .route(&format!("/{}/backup", state.api_prefix), get(handle_backup))
        .route("/health", get(handle_health))
        .layer(compression)
        .layer(cors)
        .with_state(state)
}

/// Starts the content API server.
///
/// Binds to `[server].bind`, starts the analytics recorder and serves
/// until Ctrl-C.
pub async fn run_server(mut engine: Engine) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let recorder = engine.start_recorder();
    let app = router(AppState::new(&engine));

    println!("Content API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
    })
    .await?;

    if let Some(handle) = recorder {
        handle.abort();
    }
    engine.close().await;
    println!("Server stopped");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let (status, code) = match (&err, err.kind()) {
            (EngineError::Rejected(_), _) => (StatusCode::BAD_REQUEST, "rejected"),
            (_, ErrorKind::NotFound) => (StatusCode::NOT_FOUND, "not_found"),
            (_, ErrorKind::Conflict) => (StatusCode::CONFLICT, "conflict"),
            (_, ErrorKind::InvalidInput) => (StatusCode::BAD_REQUEST, "bad_request"),
            (_, ErrorKind::Auth) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            (_, ErrorKind::Unsupported) => (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed"),
            (_, ErrorKind::Transient | ErrorKind::Programming) => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden".to_string(),
        message: message.into(),
    }
}

/// Constructs a 404 Not Found error.
fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ Layers ============

/// Queues one analytics record per API request.
async fn record_request(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let uri = req
        .extensions()
        .get::<OriginalUri>()
        .map(|o| o.0.clone())
        .unwrap_or_else(|| req.uri().clone());

    state.analytics.record(RequestRecord {
        url: uri.to_string(),
        http_method: req.method().to_string(),
        origin: header_str(req.headers(), header::ORIGIN),
        http_protocol: format!("{:?}", req.version()),
        ip_address: remote_addr(req.headers(), req.extensions()).unwrap_or_default(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        external: uri.path().contains("/content/create"),
    });

    next.run(req).await
}

/// ETag and `Cache-Control` for `GET` requests.
async fn cache_headers(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }

    let settings = state.settings.settings();
    if settings.cache_disabled {
        let mut res = next.run(req).await;
        res.headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        return res;
    }

    let max_age = settings.max_age();
    let etag = settings.etag;
    if !etag.is_empty() && header_str(req.headers(), header::IF_NONE_MATCH) == etag {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let mut res = next.run(req).await;
    if res.status().is_success() {
        let policy = format!(
            "max-age={}, public, must-revalidate, proxy-revalidate",
            max_age
        );
        let headers = res.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&etag) {
            headers.insert(header::ETAG, v);
        }
        if let Ok(v) = HeaderValue::from_str(&policy) {
            headers.insert(header::CACHE_CONTROL, v);
        }
    }
    res
}

/// Any origin, or only `domain` when `cors_disabled` is set.
fn origin_allowed(settings: &ConfigCache, origin: &HeaderValue) -> bool {
    if !settings.flag("cors_disabled") {
        return true;
    }
    let domain = settings.get_str("domain");
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let host = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let host = host.split(|c| c == '/' || c == ':').next().unwrap_or_default();
    !domain.is_empty() && host.eq_ignore_ascii_case(&domain)
}

// ============ Request helpers ============

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Peer address, or the first `X-Forwarded-For` hop when there is no
/// connection info.
fn remote_addr(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip().to_string());
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn hook_context(headers: &HeaderMap, extensions: &Extensions, form: FormValues) -> HookContext {
    HookContext {
        target: None,
        remote_addr: remote_addr(headers, extensions),
        headers: headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect(),
        form,
    }
}

/// Reads a urlencoded or multipart body. File parts are stored and their
/// field takes the upload's URL path.
async fn read_form(state: &AppState, req: Request) -> Result<FormValues, AppError> {
    let content_type = header_str(req.headers(), header::CONTENT_TYPE);

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(req, &())
            .await
            .map_err(|e| bad_request(e.body_text()))?;
        let mut form = FormValues::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| bad_request(e.body_text()))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match field.file_name().map(str::to_string) {
                Some(file_name) if !file_name.is_empty() => {
                    let mime = field
                        .content_type()
                        .unwrap_or("application/octet-stream")
                        .to_string();
                    let bytes = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;
                    let upload = state
                        .storage
                        .store_file(&file_name, &mime, &bytes, chrono::Utc::now())
                        .await?;
                    form.set(name, upload.path);
                }
                _ => {
                    let text = field.text().await.map_err(|e| bad_request(e.body_text()))?;
                    form.add(name, text);
                }
            }
        }
        Ok(form)
    } else if content_type.is_empty() {
        Ok(FormValues::new())
    } else {
        let Form(pairs) = Form::<Vec<(String, String)>>::from_request(req, &())
            .await
            .map_err(|e| bad_request(e.body_text()))?;
        Ok(FormValues::from_pairs(pairs))
    }
}

/// A registered, public type name. Sub-buckets are not addressable.
fn public_type(state: &AppState, raw: Option<String>) -> Result<String, AppError> {
    let name = raw
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| bad_request("type is required"))?;
    if name.contains("__") || !state.repo.registry().contains(&name) {
        return Err(not_found(format!("content type '{}' not found", name)));
    }
    Ok(name)
}

fn parse_int(name: &str, raw: Option<&str>, default: i64) -> Result<i64, AppError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| bad_request(format!("{} must be an integer, got '{}'", name, s))),
    }
}

fn parse_id(raw: Option<&str>) -> Result<u64, AppError> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("id is required"))?
        .parse()
        .map_err(|_| bad_request("id must be a positive integer"))
}

fn is_hidden(record: &dyn Record, ctx: &HookContext) -> bool {
    record.hideable().is_some_and(|h| h.hide(ctx))
}

/// `{"data": [...]}` with omitted fields removed and a preload `Link`
/// header for each pushable path.
fn data_response(records: &[&dyn Record]) -> Result<Response, AppError> {
    let mut data = Vec::with_capacity(records.len());
    let mut links = Vec::new();

    for record in records {
        let mut value = record.to_json().map_err(EngineError::from)?;
        for field in record.push_fields().unwrap_or_default() {
            if let Some(path) = value.get(&field).and_then(Value::as_str) {
                if !path.is_empty() {
                    links.push(format!("<{}>; rel=preload", path));
                }
            }
        }
        if let (Some(omit), Value::Object(map)) = (record.omit_fields(), &mut value) {
            for field in omit {
                map.remove(&field);
            }
        }
        data.push(value);
    }

    let mut response = Json(json!({ "data": data })).into_response();
    for link in links {
        if let Ok(v) = HeaderValue::from_str(&link) {
            response.headers_mut().append(header::LINK, v);
        }
    }
    Ok(response)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /contents ============

#[derive(Deserialize)]
struct ContentsParams {
    #[serde(rename = "type")]
    type_name: Option<String>,
    count: Option<String>,
    offset: Option<String>,
    order: Option<String>,
}

async fn handle_contents(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Query(params): Query<ContentsParams>,
) -> Result<Response, AppError> {
    let type_name = public_type(&state, params.type_name)?;
    let opts = QueryOptions {
        count: parse_int("count", params.count.as_deref(), 10)?,
        offset: parse_int("offset", params.offset.as_deref(), 0)?,
        order: params.order.as_deref().map(Order::parse).unwrap_or_default(),
    };

    let (_, records) = state.repo.query(&sorted_bucket(&type_name), opts).await?;
    let ctx = hook_context(&headers, &extensions, FormValues::new());
    let visible: Vec<&dyn Record> = records
        .iter()
        .map(|r| r.as_ref())
        .filter(|r| !is_hidden(*r, &ctx))
        .collect();
    data_response(&visible)
}

// ============ GET /content ============

#[derive(Deserialize)]
struct ContentParams {
    #[serde(rename = "type")]
    type_name: Option<String>,
    id: Option<String>,
    slug: Option<String>,
}

async fn handle_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Query(params): Query<ContentParams>,
) -> Result<Response, AppError> {
    let record = match params.slug.filter(|s| !s.is_empty()) {
        Some(slug) => state.repo.find_one_by_slug(&slug).await?.1,
        None => {
            let type_name = public_type(&state, params.type_name)?;
            let id = parse_id(params.id.as_deref())?;
            state
                .repo
                .find_one_by_target(&format!("{}:{}", type_name, id))
                .await?
        }
    };

    let ctx = hook_context(&headers, &extensions, FormValues::new());
    if is_hidden(record.as_ref(), &ctx) {
        return Err(not_found("content not found"));
    }
    data_response(&[record.as_ref()])
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    #[serde(rename = "type")]
    type_name: Option<String>,
    q: Option<String>,
    count: Option<String>,
    offset: Option<String>,
}

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Query(params): Query<SearchParams>,
) -> Result<Response, AppError> {
    let type_name = public_type(&state, params.type_name)?;
    let q = params.q.unwrap_or_default();
    if q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let count = parse_int("count", params.count.as_deref(), 10)?;
    let offset = parse_int("offset", params.offset.as_deref(), 0)?;

    let records = state.repo.search(&type_name, &q, count, offset).await?;
    let ctx = hook_context(&headers, &extensions, FormValues::new());
    let visible: Vec<&dyn Record> = records
        .iter()
        .map(|r| r.as_ref())
        .filter(|r| !is_hidden(*r, &ctx))
        .collect();
    data_response(&visible)
}

// ============ POST /content/{create,update,delete} ============

#[derive(Deserialize)]
struct TargetParams {
    #[serde(rename = "type")]
    type_name: Option<String>,
    id: Option<String>,
}

async fn handle_create(
    State(state): State<AppState>,
    Query(params): Query<TargetParams>,
    req: Request,
) -> Result<Json<Value>, AppError> {
    let type_name = public_type(&state, params.type_name)?;
    let (headers, extensions) = (req.headers().clone(), req.extensions().clone());
    let form = read_form(&state, req).await?;
    let ctx = hook_context(&headers, &extensions, form);

    let submission = state.content.api_create(&type_name, &ctx).await?;
    let mut entry = json!({
        "status": submission.status.as_str(),
        "type": submission.type_name,
    });
    if let Some(id) = submission.id {
        entry["id"] = json!(id);
    }
    Ok(Json(json!({ "data": [entry] })))
}

async fn handle_update(
    State(state): State<AppState>,
    Query(params): Query<TargetParams>,
    req: Request,
) -> Result<Json<Value>, AppError> {
    let type_name = public_type(&state, params.type_name)?;
    let id = parse_id(params.id.as_deref())?;
    let (headers, extensions) = (req.headers().clone(), req.extensions().clone());
    let form = read_form(&state, req).await?;
    let ctx = hook_context(&headers, &extensions, form);

    let record = state
        .content
        .api_update(&format!("{}:{}", type_name, id), &ctx)
        .await?;
    Ok(Json(json!({
        "data": [{ "id": record.item().id, "status": "updated", "type": type_name }]
    })))
}

async fn handle_delete(
    State(state): State<AppState>,
    Query(params): Query<TargetParams>,
    req: Request,
) -> Result<Json<Value>, AppError> {
    let type_name = public_type(&state, params.type_name)?;
    let id = parse_id(params.id.as_deref())?;
    let (headers, extensions) = (req.headers().clone(), req.extensions().clone());
    let form = read_form(&state, req).await?;
    let ctx = hook_context(&headers, &extensions, form);

    let record = state
        .content
        .api_delete(&format!("{}:{}", type_name, id), &ctx)
        .await?;
    Ok(Json(json!({
        "data": [{ "id": record.item().id, "status": "deleted", "type": type_name }]
    })))
}

// ============ Backup ============

const BACKUP_CONTENT_TYPE: &str = "application/gzip";

#[derive(Deserialize)]
struct BackupParams {
    source: Option<String>,
}

async fn handle_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<BackupParams>,
) -> Result<Response, AppError> {
    check_backup_credentials(&state.settings, &headers)?;
    let source: BackupSource = params.source.as_deref().unwrap_or_default().parse()?;
    let archive = state.backups.archive(source).await?;

    let file_name = source.file_name(chrono::Utc::now().timestamp());
    Ok((
        [
            (header::CONTENT_TYPE, BACKUP_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        archive,
    )
        .into_response())
}

/// 403 until both backup credentials are configured or when the request
/// carries none; 401 when they don't match.
fn check_backup_credentials(settings: &ConfigCache, headers: &HeaderMap) -> Result<(), AppError> {
    let user = settings.get_str("backup_basic_auth_user");
    let password = settings.get_str("backup_basic_auth_password");
    if user.is_empty() || password.is_empty() {
        return Err(forbidden("backups are not enabled"));
    }
    let Some((given_user, given_password)) = basic_credentials(headers) else {
        return Err(forbidden("basic auth required"));
    };
    if given_user != user || given_password != password {
        return Err(AppError {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized".to_string(),
            message: "invalid backup credentials".to_string(),
        });
    }
    Ok(())
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}
