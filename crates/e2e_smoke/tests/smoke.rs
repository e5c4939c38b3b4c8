use std::collections::HashMap;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const TENANT_HEADER: &str = "x-fleetlock-tenant-id";
const IMEI: &str = "359633100065759";

/// Throwaway on-disk database, removed (WAL sidecars included) when the
/// test drops it.
struct TempDb {
    path: std::path::PathBuf,
}

impl TempDb {
    fn new() -> Self {
        let path =
            std::env::temp_dir().join(format!("fleetlock_smoke_{}.db", ulid::Ulid::new()));
        Self { path }
    }

    fn url(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

async fn spawn_gateway() -> (
    TempDb,
    SocketAddr,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let db = TempDb::new();
    let config = fleetlock_gateway::config::GatewayConfig::from_kv(&HashMap::from([
        ("FLEETLOCK_BIND_ADDR".to_string(), "127.0.0.1:0".to_string()),
        ("FLEETLOCK_DB_URL".to_string(), db.url()),
        (
            "FLEETLOCK_CORS_ALLOW_ANY_ORIGIN".to_string(),
            "true".to_string(),
        ),
    ]))
    .expect("gateway config should load");

    let app = fleetlock_gateway::http::router(config)
        .await
        .expect("gateway router should initialize");

    let (addr, shutdown_tx, task) = spawn_server(app).await;
    (db, addr, shutdown_tx, task)
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral bind should succeed");
    let addr = listener.local_addr().expect("local addr should resolve");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("server should run");
    });

    (addr, shutdown_tx, task)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_register_track_lock_and_acknowledge() {
    let (_db, addr, shutdown, task) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    // Tenant T registers vehicle V.
    let res = client
        .post(format!("{}/vehicles", base))
        .header(TENANT_HEADER, "tenant_t")
        .json(&serde_json::json!({"name": "Uno", "plate": "ABC1D23", "imei": IMEI}))
        .send()
        .await
        .expect("register request should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("register body should be JSON");
    let vehicle_id = body["vehicle"]["id"].as_i64().expect("vehicle id");
    assert_eq!(body["vehicle"]["imei"], IMEI);

    // The device streams a sample, unauthenticated, keyed only by IMEI.
    let res = client
        .post(format!("{}/positions", base))
        .json(&serde_json::json!({"imei": IMEI, "latitude": -23.55, "longitude": -46.63}))
        .send()
        .await
        .expect("telemetry request should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("telemetry body should be JSON");
    assert_eq!(body["position"]["speed"], 0.0);
    assert!(body["position"]["recorded_at"].as_str().is_some_and(|s| !s.is_empty()));

    // The sample is visible to the owner.
    let res = client
        .get(format!("{}/positions", base))
        .header(TENANT_HEADER, "tenant_t")
        .query(&[("vehicle_id", vehicle_id.to_string())])
        .send()
        .await
        .expect("position query should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("positions body should be JSON");
    assert_eq!(body["total"], 1);
    assert_eq!(body["positions"][0]["latitude"], -23.55);
    assert_eq!(body["imei"], IMEI);

    // Tenant T queues a LOCK command; it starts pending.
    let res = client
        .post(format!("{}/commands", base))
        .header(TENANT_HEADER, "tenant_t")
        .json(&serde_json::json!({"vehicle_id": vehicle_id, "kind": "LOCK", "reason": "stolen"}))
        .send()
        .await
        .expect("command request should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("command body should be JSON");
    let command_id = body["command"]["id"].as_i64().expect("command id");
    assert_eq!(body["command"]["status"], "pending");
    assert_eq!(body["command"]["kind"], "LOCK");

    // The device agent acknowledges: pending -> sent -> completed.
    for status in ["sent", "completed"] {
        let res = client
            .put(format!("{}/commands", base))
            .json(&serde_json::json!({"command_id": command_id, "status": status}))
            .send()
            .await
            .expect("transition request should complete");
        assert_eq!(res.status(), 200, "transition to {} should succeed", status);
        let body: serde_json::Value = res.json().await.expect("transition body should be JSON");
        assert_eq!(body["command"]["status"], status);
    }

    // A delivery retry of the terminal status is a harmless no-op.
    let res = client
        .put(format!("{}/commands", base))
        .json(&serde_json::json!({"command_id": command_id, "status": "completed"}))
        .send()
        .await
        .expect("retry request should complete");
    assert_eq!(res.status(), 200);

    // Leaving the terminal state is rejected.
    let res = client
        .put(format!("{}/commands", base))
        .json(&serde_json::json!({"command_id": command_id, "status": "sent"}))
        .send()
        .await
        .expect("illegal transition request should complete");
    assert_eq!(res.status(), 409);
    let body: serde_json::Value = res.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_INVALID_TRANSITION");

    // The command history reflects the terminal status.
    let res = client
        .get(format!("{}/commands", base))
        .header(TENANT_HEADER, "tenant_t")
        .send()
        .await
        .expect("command list should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("list body should be JSON");
    assert_eq!(body["total"], 1);
    assert_eq!(body["commands"][0]["status"], "completed");

    let _ = shutdown.send(());
    task.await.expect("server task should shut down");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_unregistered_imei_is_rejected_without_a_trace() {
    let (_db, addr, shutdown, task) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    let res = client
        .post(format!("{}/positions", base))
        .json(&serde_json::json!({"imei": "999999999999999", "latitude": 1.0, "longitude": 2.0}))
        .send()
        .await
        .expect("telemetry request should complete");
    assert_eq!(res.status(), 404);
    let body: serde_json::Value = res.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_UNKNOWN_DEVICE");

    // Registering the device afterwards must reveal no pre-registration rows.
    let res = client
        .post(format!("{}/vehicles", base))
        .header(TENANT_HEADER, "tenant_t")
        .json(&serde_json::json!({"name": "late", "imei": "999999999999999"}))
        .send()
        .await
        .expect("register request should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("register body should be JSON");
    let vehicle_id = body["vehicle"]["id"].as_i64().expect("vehicle id");

    let res = client
        .get(format!("{}/positions", base))
        .header(TENANT_HEADER, "tenant_t")
        .query(&[("vehicle_id", vehicle_id.to_string())])
        .send()
        .await
        .expect("position query should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("positions body should be JSON");
    assert_eq!(body["total"], 0);

    let _ = shutdown.send(());
    task.await.expect("server task should shut down");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_tenant_isolation_and_enumeration_resistance() {
    let (_db, addr, shutdown, task) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    let res = client
        .post(format!("{}/vehicles", base))
        .header(TENANT_HEADER, "tenant_t")
        .json(&serde_json::json!({"name": "Uno", "imei": IMEI}))
        .send()
        .await
        .expect("register request should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("register body should be JSON");
    let vehicle_id = body["vehicle"]["id"].as_i64().expect("vehicle id");

    // A non-owner probing a real vehicle id and a nonexistent one must get
    // byte-identical error bodies.
    let foreign = client
        .get(format!("{}/positions", base))
        .header(TENANT_HEADER, "tenant_u")
        .query(&[("vehicle_id", vehicle_id.to_string())])
        .send()
        .await
        .expect("foreign query should complete");
    let foreign_status = foreign.status();
    let foreign_body: serde_json::Value = foreign.json().await.expect("JSON body");

    let missing = client
        .get(format!("{}/positions", base))
        .header(TENANT_HEADER, "tenant_u")
        .query(&[("vehicle_id", "987654")])
        .send()
        .await
        .expect("missing query should complete");
    let missing_status = missing.status();
    let missing_body: serde_json::Value = missing.json().await.expect("JSON body");

    assert_eq!(foreign_status, 404);
    assert_eq!(missing_status, 404);
    assert_eq!(foreign_body, missing_body);

    // The non-owner cannot command the vehicle either.
    let res = client
        .post(format!("{}/commands", base))
        .header(TENANT_HEADER, "tenant_u")
        .json(&serde_json::json!({"vehicle_id": vehicle_id, "kind": "LOCK"}))
        .send()
        .await
        .expect("foreign command should complete");
    assert_eq!(res.status(), 404);

    // Duplicate IMEI registration conflicts, for any tenant.
    let res = client
        .post(format!("{}/vehicles", base))
        .header(TENANT_HEADER, "tenant_u")
        .json(&serde_json::json!({"name": "clone", "imei": IMEI}))
        .send()
        .await
        .expect("duplicate register should complete");
    assert_eq!(res.status(), 409);
    let body: serde_json::Value = res.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_IMEI_CONFLICT");

    let _ = shutdown.send(());
    task.await.expect("server task should shut down");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_auth_and_validation_edges() {
    let (_db, addr, shutdown, task) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    // Tenant routes without the injected header are unauthorized.
    let res = client
        .get(format!("{}/vehicles", base))
        .send()
        .await
        .expect("unauthenticated list should complete");
    assert_eq!(res.status(), 401);
    let body: serde_json::Value = res.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_AUTH_REQUIRED");

    // A legacy tenant_id parameter that contradicts the header is rejected.
    let res = client
        .post(format!("{}/vehicles", base))
        .header(TENANT_HEADER, "tenant_t")
        .json(&serde_json::json!({"name": "Uno", "imei": IMEI, "tenant_id": "tenant_u"}))
        .send()
        .await
        .expect("mismatched register should complete");
    assert_eq!(res.status(), 400);
    let body: serde_json::Value = res.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_TENANT_MISMATCH");

    // An IMEI past the length cap is rejected up front, before any
    // per-device bookkeeping can key off it.
    let res = client
        .post(format!("{}/positions", base))
        .json(&serde_json::json!({
            "imei": "9".repeat(4096),
            "latitude": -23.55,
            "longitude": -46.63,
        }))
        .send()
        .await
        .expect("oversized imei should complete");
    assert_eq!(res.status(), 400);
    let body: serde_json::Value = res.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_INVALID_PARAMS");

    // Missing telemetry fields are a 400, not a silent default.
    let res = client
        .post(format!("{}/positions", base))
        .json(&serde_json::json!({"imei": IMEI, "latitude": -23.55}))
        .send()
        .await
        .expect("partial telemetry should complete");
    assert_eq!(res.status(), 400);

    // Unknown command kinds and statuses are rejected up front.
    let res = client
        .post(format!("{}/vehicles", base))
        .header(TENANT_HEADER, "tenant_t")
        .json(&serde_json::json!({"name": "Uno", "imei": IMEI}))
        .send()
        .await
        .expect("register should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("register body should be JSON");
    let vehicle_id = body["vehicle"]["id"].as_i64().expect("vehicle id");

    let res = client
        .post(format!("{}/commands", base))
        .header(TENANT_HEADER, "tenant_t")
        .json(&serde_json::json!({"vehicle_id": vehicle_id, "kind": "REBOOT"}))
        .send()
        .await
        .expect("bad kind should complete");
    assert_eq!(res.status(), 400);

    let res = client
        .put(format!("{}/commands", base))
        .json(&serde_json::json!({"command_id": 1, "status": "done"}))
        .send()
        .await
        .expect("bad status should complete");
    assert_eq!(res.status(), 400);

    // Acknowledging a command id that was never issued is a 404.
    let res = client
        .put(format!("{}/commands", base))
        .json(&serde_json::json!({"command_id": 424242, "status": "sent"}))
        .send()
        .await
        .expect("unknown command ack should complete");
    assert_eq!(res.status(), 404);
    let body: serde_json::Value = res.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_COMMAND_NOT_FOUND");

    let _ = shutdown.send(());
    task.await.expect("server task should shut down");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_cors_and_vehicle_removal() {
    let (_db, addr, shutdown, task) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    // Permissive CORS is enabled in the test config.
    let res = client
        .get(format!("{}/healthz", base))
        .send()
        .await
        .expect("healthz should complete");
    assert_eq!(res.status(), 200);
    assert_eq!(
        res.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );

    let res = client
        .request(reqwest::Method::OPTIONS, format!("{}/commands", base))
        .send()
        .await
        .expect("preflight should complete");
    assert_eq!(res.status(), 204);
    assert!(res.headers().contains_key("access-control-allow-methods"));

    // Register, then remove; history access dies with the registration.
    let res = client
        .post(format!("{}/vehicles", base))
        .header(TENANT_HEADER, "tenant_t")
        .json(&serde_json::json!({"name": "Uno", "imei": IMEI}))
        .send()
        .await
        .expect("register should complete");
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.expect("register body should be JSON");
    let vehicle_id = body["vehicle"]["id"].as_i64().expect("vehicle id");

    let res = client
        .delete(format!("{}/vehicles", base))
        .header(TENANT_HEADER, "tenant_t")
        .query(&[("vehicle_id", vehicle_id.to_string())])
        .send()
        .await
        .expect("delete should complete");
    assert_eq!(res.status(), 200);

    let res = client
        .get(format!("{}/positions", base))
        .header(TENANT_HEADER, "tenant_t")
        .query(&[("vehicle_id", vehicle_id.to_string())])
        .send()
        .await
        .expect("post-delete query should complete");
    assert_eq!(res.status(), 404);

    let res = client
        .get(format!("{}/readyz", base))
        .send()
        .await
        .expect("readyz should complete");
    assert_eq!(res.status(), 200);

    let _ = shutdown.send(());
    task.await.expect("server task should shut down");
}
