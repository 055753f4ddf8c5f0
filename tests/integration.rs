use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use driver_sync::alert::LogOutputs;
use driver_sync::api::rest::router;
use driver_sync::backend::memory::MemoryBackend;
use driver_sync::backend::{Backend, DRIVERS_TABLE, ORDERS_TABLE, row};
use driver_sync::config::Config;
use driver_sync::engine::realtime::{run_order_feed, run_refresh_loop};
use driver_sync::finalize::notify::LogLinkOpener;
use driver_sync::state::AppState;
use driver_sync::store::LocalStore;
use driver_sync::tracking::location::PushLocationProvider;
use serde_json::{Value, json};
use tokio::time::{Duration, sleep, timeout};
use tower::ServiceExt;

struct Session {
    app: axum::Router,
    state: Arc<AppState>,
    backend: Arc<MemoryBackend>,
}

fn setup() -> Session {
    let backend = Arc::new(MemoryBackend::recording(256));
    let config = Config {
        driver_id: Some(7),
        ..Config::default()
    };
    let state = Arc::new(AppState::new(
        config,
        backend.clone(),
        Arc::new(PushLocationProvider::new(true)),
        Arc::new(LogOutputs),
        Arc::new(LogLinkOpener),
        LocalStore::in_memory(20),
    ));

    Session {
        app: router(state.clone()),
        state,
        backend,
    }
}

fn seed_orders(backend: &MemoryBackend) {
    backend.seed(
        ORDERS_TABLE,
        vec![
            row([
                ("id", json!(1)),
                ("driver_id", json!(7)),
                ("status", json!("pending")),
                ("cliente", json!("Ana")),
                ("endereco", json!("Rua das Flores, 10")),
            ]),
            row([
                ("id", json!(2)),
                ("driver_id", json!(7)),
                ("status", json!("en_route")),
                ("customer", json!("Bruno")),
                ("address", json!("Av. Beira Mar, 200")),
            ]),
            row([
                ("id", json!(3)),
                ("driver_id", json!(9)),
                ("status", json!("pending")),
                ("customer", json!("Someone else")),
            ]),
        ],
    );
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn refresh(session: &Session) -> Value {
    let response = session
        .app
        .clone()
        .oneshot(empty_request("POST", "/orders/refresh"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn health_returns_ok() {
    let session = setup();
    let response = session.app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["driver_id"], 7);
    assert_eq!(body["active_orders"], 0);
    assert_eq!(body["alert"]["state"], "idle");
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let session = setup();
    let response = session.app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("active_orders"));
    assert!(body.contains("alerts_total"));
}

#[tokio::test]
async fn refresh_loads_only_this_drivers_active_orders() {
    let session = setup();
    seed_orders(&session.backend);

    let outcome = refresh(&session).await;
    assert_eq!(outcome["outcome"], "loaded");
    assert_eq!(outcome["count"], 2);

    let response = session.app.clone().oneshot(get_request("/orders")).await.unwrap();
    let body = body_json(response).await;
    let orders = body.as_array().unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0]["id"], 2);
    assert_eq!(orders[0]["status"], "en_route");
    assert_eq!(orders[1]["customer"], "Ana");
}

#[tokio::test]
async fn move_out_of_range_is_rejected() {
    let session = setup();
    seed_orders(&session.backend);
    refresh(&session).await;

    let response = session
        .app
        .clone()
        .oneshot(json_request("POST", "/orders/move", json!({ "from": 0, "to": 5 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = session
        .app
        .oneshot(json_request("POST", "/orders/move", json!({ "from": 1, "to": 0 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body[0]["id"], 1);
    assert!(session.state.repo.is_manually_reordered());
}

#[tokio::test]
async fn delivery_missing_unit_is_rejected_before_any_write() {
    let session = setup();
    seed_orders(&session.backend);
    refresh(&session).await;

    let response = session
        .app
        .oneshot(json_request(
            "POST",
            "/orders/1/deliver",
            json!({ "category": "apartment", "name": "Maria" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "enter the unit number");
    assert_eq!(session.backend.count_calls("update", ORDERS_TABLE), 0);
    assert_eq!(session.state.repo.len(), 2);
}

#[tokio::test]
async fn finalizing_an_unknown_order_is_not_found() {
    let session = setup();
    seed_orders(&session.backend);
    refresh(&session).await;

    let response = session
        .app
        .oneshot(json_request("POST", "/orders/3/fail", json!({ "reason": "closed" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delivery_with_fresh_position_completes() {
    let session = setup();
    seed_orders(&session.backend);
    refresh(&session).await;

    let response = session
        .app
        .clone()
        .oneshot(json_request("POST", "/position", json!({ "lat": -27.59, "lng": -48.55 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = session
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/orders/1/deliver",
            json!({ "category": "apartment", "name": "Maria", "unit": "302" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["outcome"], "completed");
    assert_eq!(body["status"], "delivered");
    assert_eq!(body["receiver"], "Apartment: Maria (unit 302)");
    assert_eq!(body["completion"]["lat"], -27.59);
    assert_eq!(body["notification"], "unavailable");

    let stored = &session.backend.rows(ORDERS_TABLE)[0];
    assert_eq!(stored["status"], "delivered");

    let response = session.app.clone().oneshot(get_request("/orders")).await.unwrap();
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let response = session
        .app
        .clone()
        .oneshot(get_request("/orders/history"))
        .await
        .unwrap();
    assert_eq!(body_json(response).await[0]["id"], 1);

    let response = session
        .app
        .oneshot(get_request("/receivers/recent"))
        .await
        .unwrap();
    assert_eq!(body_json(response).await, json!(["Maria"]));
}

#[tokio::test(start_paused = true)]
async fn failure_without_position_completes_after_gps_timeout() {
    let session = setup();
    seed_orders(&session.backend);
    refresh(&session).await;

    let response = session
        .app
        .clone()
        .oneshot(empty_request("POST", "/orders/2/fail"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["reason"], "not informed");
    assert!(body["completion"].is_null());
    assert_eq!(session.state.repo.len(), 1);
    assert!(session.state.repo.history().is_empty());
}

#[tokio::test]
async fn rejected_write_keeps_the_order() {
    let session = setup();
    seed_orders(&session.backend);
    refresh(&session).await;
    session.state.location.push(driver_sync::models::position::Fix {
        point: driver_sync::models::position::GeoPoint::new(-27.59, -48.55),
        heading: None,
        taken_at: chrono::Utc::now(),
    });
    session.backend.fail_writes(true);

    let response = session
        .app
        .oneshot(json_request(
            "POST",
            "/orders/1/deliver",
            json!({ "category": "customer", "name": "Ana" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(session.state.repo.len(), 2);
    assert_eq!(session.state.repo.selected().map(|o| o.id.0), Some(1));
}

#[tokio::test]
async fn dispatched_orders_reach_the_driver_and_raise_alert() {
    let session = setup();
    let mut changes = session.state.repo.subscribe_changes();
    tokio::spawn(run_order_feed(
        session.state.clone(),
        session.backend.subscribe(ORDERS_TABLE),
    ));

    let response = session
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/dispatch/orders",
            json!({ "driver_id": 7, "customer": "Carla", "address": "Rua A, 1", "service_type": "recolha" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["service"], "pickup");
    let id = created["id"].as_i64().unwrap();

    assert_eq!(changes.recv().await.unwrap().len(), 1);

    let response = session
        .app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/dispatch/orders/{id}/status"),
            json!({ "status": "en_route" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    changes.recv().await.unwrap();

    let response = session.app.clone().oneshot(get_request("/health")).await.unwrap();
    let health = body_json(response).await;
    assert_eq!(health["alert"]["state"], "alerting");
    assert_eq!(health["alert"]["order_id"], id);

    let response = session
        .app
        .clone()
        .oneshot(empty_request("POST", "/alert/dismiss"))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["was_alerting"], true);

    let response = session
        .app
        .oneshot(empty_request("DELETE", &format!("/dispatch/orders/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(changes.recv().await.unwrap().is_empty());
}

#[tokio::test]
async fn dispatch_rejects_unknown_status_and_missing_order() {
    let session = setup();

    let response = session
        .app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/dispatch/orders/1/status",
            json!({ "status": "teleported" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = session
        .app
        .oneshot(empty_request("DELETE", "/dispatch/orders/42"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logout_clears_published_position() {
    let session = setup();
    session.backend.seed(
        DRIVERS_TABLE,
        vec![row([
            ("id", json!(7)),
            ("lat", json!(-27.59)),
            ("lng", json!(-48.55)),
            ("last_signal", json!("2026-10-19T10:00:00Z")),
        ])],
    );

    let response = session
        .app
        .oneshot(empty_request("POST", "/logout"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["cleared_now"], true);
    assert_eq!(body["fallback_scheduled"], true);

    let driver = &session.backend.rows(DRIVERS_TABLE)[0];
    assert!(driver["lat"].is_null());
    assert!(driver["last_signal"].is_null());
    assert_eq!(session.state.store.driver_id(), None);
}

#[tokio::test]
async fn logout_unsubscribes_the_order_feed() {
    let session = setup();
    let feed = tokio::spawn(run_order_feed(
        session.state.clone(),
        session.backend.subscribe(ORDERS_TABLE),
    ));

    let response = session
        .app
        .oneshot(empty_request("POST", "/logout"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(timeout(Duration::from_secs(1), feed).await.is_ok());

    session
        .backend
        .insert(
            ORDERS_TABLE,
            row([("driver_id", json!(7)), ("status", json!("en_route"))]),
        )
        .await
        .unwrap();
    tokio::task::yield_now().await;

    assert!(session.state.repo.is_empty());
    assert!(!session.state.alert.is_alerting());
}

#[tokio::test(start_paused = true)]
async fn logout_stops_periodic_refresh() {
    let session = setup();
    let refresher = tokio::spawn(run_refresh_loop(session.state.clone()));

    sleep(Duration::from_secs(1)).await;
    let before = session.backend.count_calls("select", ORDERS_TABLE);
    assert_eq!(before, 1);

    let response = session
        .app
        .oneshot(empty_request("POST", "/logout"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(timeout(Duration::from_secs(1), refresher).await.is_ok());

    sleep(Duration::from_secs(95)).await;
    assert_eq!(session.backend.count_calls("select", ORDERS_TABLE), before);
}

#[tokio::test]
async fn position_out_of_range_is_rejected() {
    let session = setup();
    let response = session
        .app
        .oneshot(json_request("POST", "/position", json!({ "lat": 120.0, "lng": 10.0 })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn fleet_lists_known_drivers() {
    let session = setup();
    session.state.fleet.apply_upsert(&row([
        ("id", json!(4)),
        ("nome", json!("Carlos")),
        ("latitude", json!(-27.59)),
        ("longitude", json!(-48.55)),
        ("ultimo_sinal", json!(chrono::Utc::now().to_rfc3339())),
    ]));

    let response = session.app.oneshot(get_request("/fleet")).await.unwrap();
    let body = body_json(response).await;

    assert_eq!(body[0]["driver_id"], 4);
    assert_eq!(body[0]["name"], "Carlos");
    assert_eq!(body[0]["online"], true);
}
