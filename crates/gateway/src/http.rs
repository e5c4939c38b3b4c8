use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use fleetlock_contracts::{
    validate_imei, Command, CommandKind, CommandStatus, PositionSample, Vehicle,
};
use fleetlock_store::{NewPosition, Store, StoreError};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::config::{GatewayConfig, StartupError};
use crate::rate_limit::RateLimiter;

const TENANT_HEADER: &str = "x-fleetlock-tenant-id";
const REQUEST_ID_HEADER: &str = "x-fleetlock-request-id";

/// One fixed message for "does not exist" and "owned by someone else", so a
/// non-owner cannot discover which vehicle ids are taken.
const NOT_ACCESSIBLE_MESSAGE: &str = "vehicle not found or not accessible";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    store: Store,
    rate_limiter: RateLimiter,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let (router, _store) = build(config).await?;
    Ok(router)
}

/// Like [`router`], but also hands back the store so the caller can close
/// the pool on shutdown.
pub async fn build(config: GatewayConfig) -> Result<(Router, Store), StartupError> {
    let store = Store::connect_and_migrate(
        &config.db_url,
        Duration::from_millis(config.store_write_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_STORE_UNAVAILABLE",
        message: format!("failed to initialize store: {}", err),
    })?;

    let rate_limiter = RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs),
        16_384,
    );

    let state = AppState {
        config,
        store: store.clone(),
        rate_limiter,
    };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/positions",
            get(list_positions).post(submit_position),
        )
        .route(
            "/commands",
            get(list_commands)
                .post(create_command)
                .put(update_command_status),
        )
        .route(
            "/vehicles",
            get(list_vehicles)
                .post(register_vehicle)
                .delete(remove_vehicle),
        )
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state);

    Ok((router, store))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = tokio::time::timeout(Duration::from_millis(500), state.store.ping())
        .await
        .is_ok_and(|res| res.is_ok());
    checks.insert("store", store_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

/// The serverless ancestor of this API answered every request with
/// `Access-Control-Allow-Origin: *`; the VPS variant restricts origins at
/// the fronting proxy instead. Enabled via FLEETLOCK_CORS_ALLOW_ANY_ORIGIN.
async fn cors(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.config.cors_allow_any_origin {
        return next.run(req).await;
    }

    if req.method() == Method::OPTIONS {
        let mut res = StatusCode::NO_CONTENT.into_response();
        let headers = res.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("content-type, x-fleetlock-tenant-id, x-fleetlock-request-id"),
        );
        return res;
    }

    let mut res = next.run(req).await;
    res.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    res
}

// ---------------------------------------------------------------------------
// Telemetry ingestion (device-facing)

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitPositionRequest {
    imei: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    event: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitPositionResponse {
    message: &'static str,
    position: PositionSample,
}

async fn submit_position(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<SubmitPositionRequest>, JsonRejection>,
) -> Result<Json<SubmitPositionResponse>, ApiError> {
    let request_id = extract_request_id(&headers);
    let Json(req) = req.map_err(invalid_body)?;

    // Validated before the IMEI becomes a limiter key; the key map must
    // not hold unbounded client strings.
    validate_imei(&req.imei).map_err(|reason| {
        json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS", reason, false)
    })?;

    if !state.rate_limiter.allow(
        format!("positions:{}", req.imei).as_str(),
        state.config.rate_limit_positions_per_window,
    ) {
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "telemetry rate limit exceeded for this device",
            true,
        ));
    }

    let started = Instant::now();
    let position = state
        .store
        .append_position(
            &req.imei,
            &NewPosition {
                latitude: req.latitude,
                longitude: req.longitude,
                speed: req.speed,
                event: req.event.as_deref(),
            },
        )
        .await
        .map_err(store_error_response)?;

    tracing::info!(
        request_id = %request_id,
        imei = %position.imei,
        position_id = position.id,
        latency_ms = started.elapsed().as_millis() as u64,
        "positions.accepted"
    );

    Ok(Json(SubmitPositionResponse {
        message: "position recorded",
        position,
    }))
}

#[derive(Debug, Deserialize)]
struct ListPositionsQuery {
    vehicle_id: Option<i64>,
    tenant_id: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ListPositionsResponse {
    positions: Vec<PositionSample>,
    total: usize,
    vehicle_id: i64,
    imei: String,
}

async fn list_positions(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListPositionsQuery>, QueryRejection>,
) -> Result<Json<ListPositionsResponse>, ApiError> {
    let tenant_id = extract_tenant(&headers)?;
    let Query(query) = query.map_err(invalid_query)?;
    enforce_tenant_match(&tenant_id, query.tenant_id.as_deref())?;

    let vehicle_id = query.vehicle_id.ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "vehicle_id is required",
            false,
        )
    })?;
    let limit = resolve_limit(
        query.limit,
        state.config.default_page_size,
        state.config.max_page_size,
    )
    .map_err(|reason| {
        json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS", reason, false)
    })?;

    let page = state
        .store
        .query_positions(&tenant_id, vehicle_id, limit)
        .await
        .map_err(store_error_response)?;

    Ok(Json(ListPositionsResponse {
        total: page.samples.len(),
        positions: page.samples,
        vehicle_id,
        imei: page.imei,
    }))
}

// ---------------------------------------------------------------------------
// Command dispatch (tenant-facing) and acknowledgement (device-agent-facing)

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateCommandRequest {
    vehicle_id: i64,
    kind: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommandResponse {
    message: String,
    command: Command,
}

async fn create_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<CreateCommandRequest>, JsonRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let request_id = extract_request_id(&headers);
    let tenant_id = extract_tenant(&headers)?;
    let Json(req) = req.map_err(invalid_body)?;
    enforce_tenant_match(&tenant_id, req.tenant_id.as_deref())?;

    let kind = CommandKind::parse(&req.kind).ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "kind must be LOCK or UNLOCK",
            false,
        )
    })?;

    if !state.rate_limiter.allow(
        format!("commands:{}", tenant_id).as_str(),
        state.config.rate_limit_commands_per_window,
    ) {
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "command rate limit exceeded",
            true,
        ));
    }

    let started = Instant::now();
    let command = state
        .store
        .create_command(&tenant_id, req.vehicle_id, kind, req.reason.as_deref())
        .await
        .map_err(store_error_response)?;

    tracing::info!(
        request_id = %request_id,
        tenant_id = %tenant_id,
        vehicle_id = req.vehicle_id,
        command_id = command.id,
        kind = kind.as_str(),
        latency_ms = started.elapsed().as_millis() as u64,
        "commands.created"
    );

    Ok(Json(CommandResponse {
        message: format!("{} command queued", kind.as_str()),
        command,
    }))
}

#[derive(Debug, Deserialize)]
struct ListCommandsQuery {
    vehicle_id: Option<i64>,
    tenant_id: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ListCommandsResponse {
    commands: Vec<Command>,
    total: usize,
}

async fn list_commands(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListCommandsQuery>, QueryRejection>,
) -> Result<Json<ListCommandsResponse>, ApiError> {
    let tenant_id = extract_tenant(&headers)?;
    let Query(query) = query.map_err(invalid_query)?;
    enforce_tenant_match(&tenant_id, query.tenant_id.as_deref())?;

    let limit = resolve_limit(
        query.limit,
        state.config.default_page_size,
        state.config.max_page_size,
    )
    .map_err(|reason| {
        json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS", reason, false)
    })?;

    let commands = state
        .store
        .list_commands(&tenant_id, query.vehicle_id, limit)
        .await
        .map_err(store_error_response)?;

    Ok(Json(ListCommandsResponse {
        total: commands.len(),
        commands,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateCommandStatusRequest {
    command_id: i64,
    status: String,
}

/// Device-agent path: no tenant auth, possession of the command id is the
/// credential. Retries after a network timeout are safe because a repeat of
/// the current status is a no-op.
async fn update_command_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<UpdateCommandStatusRequest>, JsonRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let request_id = extract_request_id(&headers);
    let Json(req) = req.map_err(invalid_body)?;

    let status = CommandStatus::parse(&req.status).ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "status must be pending, sent, completed or failed",
            false,
        )
    })?;

    let command = state
        .store
        .transition_command(req.command_id, status)
        .await
        .map_err(store_error_response)?;

    tracing::info!(
        request_id = %request_id,
        command_id = command.id,
        status = command.status.as_str(),
        "commands.status_updated"
    );

    Ok(Json(CommandResponse {
        message: "command status updated".to_string(),
        command,
    }))
}

// ---------------------------------------------------------------------------
// Vehicle registry (tenant-facing)

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterVehicleRequest {
    name: String,
    #[serde(default)]
    plate: Option<String>,
    imei: String,
    #[serde(default)]
    tenant_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct VehicleResponse {
    message: &'static str,
    vehicle: Vehicle,
}

async fn register_vehicle(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<RegisterVehicleRequest>, JsonRejection>,
) -> Result<Json<VehicleResponse>, ApiError> {
    let request_id = extract_request_id(&headers);
    let tenant_id = extract_tenant(&headers)?;
    let Json(req) = req.map_err(invalid_body)?;
    enforce_tenant_match(&tenant_id, req.tenant_id.as_deref())?;

    let vehicle = state
        .store
        .register_vehicle(&tenant_id, &req.name, req.plate.as_deref(), &req.imei)
        .await
        .map_err(store_error_response)?;

    tracing::info!(
        request_id = %request_id,
        tenant_id = %tenant_id,
        vehicle_id = vehicle.id,
        imei = %vehicle.imei,
        "vehicles.registered"
    );

    Ok(Json(VehicleResponse {
        message: "vehicle registered",
        vehicle,
    }))
}

#[derive(Debug, Serialize)]
struct ListVehiclesResponse {
    vehicles: Vec<Vehicle>,
    total: usize,
}

async fn list_vehicles(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListVehiclesResponse>, ApiError> {
    let tenant_id = extract_tenant(&headers)?;

    let vehicles = state
        .store
        .list_vehicles(&tenant_id)
        .await
        .map_err(store_error_response)?;

    Ok(Json(ListVehiclesResponse {
        total: vehicles.len(),
        vehicles,
    }))
}

#[derive(Debug, Deserialize)]
struct RemoveVehicleQuery {
    vehicle_id: Option<i64>,
    tenant_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RemoveVehicleResponse {
    message: &'static str,
}

async fn remove_vehicle(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<RemoveVehicleQuery>, QueryRejection>,
) -> Result<Json<RemoveVehicleResponse>, ApiError> {
    let request_id = extract_request_id(&headers);
    let tenant_id = extract_tenant(&headers)?;
    let Query(query) = query.map_err(invalid_query)?;
    enforce_tenant_match(&tenant_id, query.tenant_id.as_deref())?;

    let vehicle_id = query.vehicle_id.ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "vehicle_id is required",
            false,
        )
    })?;

    state
        .store
        .delete_vehicle(&tenant_id, vehicle_id)
        .await
        .map_err(store_error_response)?;

    tracing::info!(
        request_id = %request_id,
        tenant_id = %tenant_id,
        vehicle_id,
        "vehicles.removed"
    );

    Ok(Json(RemoveVehicleResponse {
        message: "vehicle removed",
    }))
}

// ---------------------------------------------------------------------------
// Shared plumbing

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

fn invalid_body(_: JsonRejection) -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_PARAMS",
        "invalid JSON body",
        false,
    )
}

fn invalid_query(_: QueryRejection) -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_PARAMS",
        "invalid query parameters",
        false,
    )
}

/// The single place where store errors become transport status codes; no
/// layer below the gateway knows HTTP.
fn store_error_response(err: StoreError) -> ApiError {
    match err {
        StoreError::InvalidArgument(reason) => {
            json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS", reason, false)
        }
        StoreError::UnknownDevice => json_error(
            StatusCode::NOT_FOUND,
            "ERR_UNKNOWN_DEVICE",
            "imei is not registered",
            false,
        ),
        StoreError::NotAccessible => json_error(
            StatusCode::NOT_FOUND,
            "ERR_VEHICLE_NOT_ACCESSIBLE",
            NOT_ACCESSIBLE_MESSAGE,
            false,
        ),
        StoreError::CommandNotFound => json_error(
            StatusCode::NOT_FOUND,
            "ERR_COMMAND_NOT_FOUND",
            "command not found",
            false,
        ),
        StoreError::Conflict => json_error(
            StatusCode::CONFLICT,
            "ERR_IMEI_CONFLICT",
            "imei is already registered",
            false,
        ),
        StoreError::InvalidTransition => json_error(
            StatusCode::CONFLICT,
            "ERR_INVALID_TRANSITION",
            "command status transition is not allowed",
            false,
        ),
        StoreError::Timeout | StoreError::Sqlx(_) => {
            tracing::error!(error = %err, "store operation failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ERR_STORAGE",
                "storage operation failed",
                true,
            )
        }
    }
}

fn extract_tenant(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                format!("missing {} header", TENANT_HEADER),
                false,
            )
        })
}

/// Legacy clients still send tenant_id in the query string or body. It is
/// never trusted on its own: it must match the authenticated header.
fn enforce_tenant_match(authenticated: &str, supplied: Option<&str>) -> Result<(), ApiError> {
    match supplied.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(()),
        Some(supplied) if supplied == authenticated => Ok(()),
        Some(_) => Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_TENANT_MISMATCH",
            "tenant_id does not match the authenticated tenant",
            false,
        )),
    }
}

fn resolve_limit(requested: Option<u32>, default: u32, max: u32) -> Result<u32, &'static str> {
    match requested {
        None => Ok(default),
        Some(0) => Err("limit must be positive"),
        Some(n) => Ok(n.min(max)),
    }
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
