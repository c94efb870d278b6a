use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use courier_dispatch::api::rest::router;
use courier_dispatch::config::DispatchSettings;
use courier_dispatch::engine::offers::create_offer;
use courier_dispatch::notify::LogNotifier;
use courier_dispatch::state::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const STORE: (f64, f64) = (-6.2, 106.8);

fn shared_state() -> Arc<AppState> {
    Arc::new(AppState::new(
        DispatchSettings::default(),
        1024,
        Arc::new(LogNotifier),
    ))
}

fn setup() -> axum::Router {
    router(shared_state())
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

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

/// Registers an active driver `km` north of the store.
async fn active_driver(app: &axum::Router, name: &str, km: f64) -> String {
    let (status, driver) = send(
        app,
        json_request(
            "POST",
            "/drivers",
            json!({
                "user_id": Uuid::new_v4(),
                "name": name,
                "device_token": format!("{name}-device"),
                "location": { "lat": STORE.0 + km / 111.32, "lng": STORE.1 }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = driver["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        app,
        json_request(
            "PATCH",
            &format!("/drivers/{id}/status"),
            json!({ "status": "active" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    id
}

async fn place_order(app: &axum::Router, store_id: &str, quantity: u32) -> (Value, String) {
    let (status, item) = send(
        app,
        json_request(
            "POST",
            "/menu-items",
            json!({ "store_id": store_id, "name": "martabak", "quantity": 5 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let item_id = item["id"].as_str().unwrap().to_string();

    let (status, order) = send(
        app,
        json_request(
            "POST",
            "/orders",
            json!({
                "customer_id": Uuid::new_v4(),
                "store_id": store_id,
                "pickup": { "lat": STORE.0, "lng": STORE.1 },
                "dropoff": { "lat": STORE.0 + 0.01, "lng": STORE.1 },
                "items": [{ "menu_item_id": item_id, "quantity": quantity }]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (order, item_id)
}

#[tokio::test]
async fn health_returns_ok() {
    let app = setup();
    let (status, body) = send(&app, get_request("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["drivers"], 0);
    assert_eq!(body["orders"], 0);
    assert_eq!(body["offers"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let app = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

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
    assert!(body.contains("active_dispatches"));
}

#[tokio::test]
async fn create_driver_starts_inactive_without_rating() {
    let app = setup();
    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/drivers",
            json!({ "user_id": Uuid::new_v4(), "name": "Budi" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Budi");
    assert_eq!(body["status"], "inactive");
    assert_eq!(body["reviews_count"], 0);
    assert!(body["location"].is_null());
}

#[tokio::test]
async fn create_driver_empty_name_returns_400() {
    let app = setup();
    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/drivers",
            json!({ "user_id": Uuid::new_v4(), "name": "  " }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn drivers_cannot_mark_themselves_busy() {
    let app = setup();
    let id = active_driver(&app, "sari", 1.0).await;

    let (status, _) = send(
        &app,
        json_request(
            "PATCH",
            &format!("/drivers/{id}/status"),
            json!({ "status": "busy" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_driver_location() {
    let app = setup();
    let id = active_driver(&app, "andi", 1.0).await;

    let (status, body) = send(
        &app,
        json_request(
            "PATCH",
            &format!("/drivers/{id}/location"),
            json!({ "location": { "lat": -6.17, "lng": 106.82 } }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["location"]["lat"], -6.17);
    assert_eq!(body["location"]["lng"], 106.82);
}

#[tokio::test]
async fn get_nonexistent_order_returns_404() {
    let app = setup();
    let fake_id = "00000000-0000-0000-0000-000000000000";
    let (status, body) = send(&app, get_request(&format!("/orders/{fake_id}"))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn create_order_returns_pending_and_reserves_stock() {
    let app = setup();
    let store_id = Uuid::new_v4().to_string();
    let (order, item_id) = place_order(&app, &store_id, 2).await;

    assert_eq!(order["order_status"], "pending");
    assert_eq!(order["delivery_status"], "pending");
    assert!(order["driver_id"].is_null());

    let (_, item) = send(&app, get_request(&format!("/menu-items/{item_id}"))).await;
    assert_eq!(item["quantity"], 3);
}

#[tokio::test]
async fn second_approval_is_a_conflict() {
    let app = setup();
    let store_id = Uuid::new_v4().to_string();
    let (order, _) = place_order(&app, &store_id, 1).await;
    let order_id = order["id"].as_str().unwrap();

    let approve = || {
        json_request(
            "POST",
            &format!("/orders/{order_id}/approve"),
            json!({ "store_id": store_id }),
        )
    };
    let (status, body) = send(&app, approve()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order_status"], "preparing");

    let (status, body) = send(&app, approve()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "state_conflict");
}

#[tokio::test]
async fn losing_accept_reports_order_already_taken() {
    let state = shared_state();
    let app = router(state.clone());
    let store_id = Uuid::new_v4().to_string();
    let first = active_driver(&app, "first", 1.0).await;
    let second = active_driver(&app, "second", 2.0).await;
    let (order, _) = place_order(&app, &store_id, 1).await;
    let order_id: Uuid = order["id"].as_str().unwrap().parse().unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    let (_, offers) = send(&app, get_request(&format!("/orders/{order_id}/offers"))).await;
    let offers = offers.as_array().unwrap().clone();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0]["driver_id"], first.as_str());

    let parallel = create_offer(&state, order_id, second.parse().unwrap())
        .await
        .unwrap();

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            &format!("/offers/{}/respond", offers[0]["id"].as_str().unwrap()),
            json!({ "driver_id": first, "action": "accept" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/offers/{}/respond", parallel.id),
            json!({ "driver_id": second, "action": "accept" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "order_already_taken");

    let (_, offer) = send(&app, get_request(&format!("/offers/{}", parallel.id))).await;
    assert_eq!(offer["status"], "pending");
}

#[tokio::test]
async fn full_delivery_flow() {
    let app = setup();
    let store_id = Uuid::new_v4().to_string();
    let far = active_driver(&app, "far", 3.0).await;
    let near = active_driver(&app, "near", 1.0).await;
    let (order, item_id) = place_order(&app, &store_id, 1).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

    let (_, offers) = send(&app, get_request(&format!("/orders/{order_id}/offers"))).await;
    let offers = offers.as_array().unwrap().clone();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0]["driver_id"], near.as_str());
    assert_eq!(offers[0]["status"], "pending");
    let offer_id = offers[0]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/offers/{offer_id}/respond"),
            json!({ "driver_id": near, "action": "accept" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");

    let (_, driver) = send(&app, get_request(&format!("/drivers/{near}"))).await;
    assert_eq!(driver["status"], "busy");
    let (_, driver) = send(&app, get_request(&format!("/drivers/{far}"))).await;
    assert_eq!(driver["status"], "active");

    for step in ["approve", "ready"] {
        let (status, _) = send(
            &app,
            json_request(
                "POST",
                &format!("/orders/{order_id}/{step}"),
                json!({ "store_id": store_id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{step}");
    }

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/orders/{order_id}/start-delivery"),
            json!({ "driver_id": far }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/orders/{order_id}/start-delivery"),
            json!({ "driver_id": near }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order_status"], "on_delivery");
    assert_eq!(body["delivery_status"], "on_way");

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/orders/{order_id}/complete"),
            json!({ "driver_id": near }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order"]["order_status"], "delivered");
    assert_eq!(body["rating"]["rating"], 5);

    let (status, rating) = send(&app, get_request(&format!("/orders/{order_id}/rating"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rating["driver_id"], near.as_str());

    let (_, driver) = send(&app, get_request(&format!("/drivers/{near}"))).await;
    assert_eq!(driver["status"], "active");
    assert_eq!(driver["reviews_count"], 1);
    assert_eq!(driver["rating"], 5.0);

    let (_, tracking) = send(&app, get_request(&format!("/orders/{order_id}/tracking"))).await;
    let tracking = tracking.as_array().unwrap();
    assert_eq!(tracking.first().unwrap()["status"], "pending");
    assert_eq!(tracking.last().unwrap()["status"], "delivered");

    let (_, item) = send(&app, get_request(&format!("/menu-items/{item_id}"))).await;
    assert_eq!(item["quantity"], 4);
}

#[tokio::test]
async fn customer_cancel_frees_driver_and_restores_stock() {
    let app = setup();
    let store_id = Uuid::new_v4().to_string();
    let driver = active_driver(&app, "dewi", 1.0).await;
    let (order, item_id) = place_order(&app, &store_id, 2).await;
    let order_id = order["id"].as_str().unwrap().to_string();
    let customer_id = order["customer_id"].as_str().unwrap().to_string();

    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    let (_, offers) = send(&app, get_request(&format!("/orders/{order_id}/offers"))).await;
    let offer_id = offers[0]["id"].as_str().unwrap().to_string();
    send(
        &app,
        json_request(
            "POST",
            &format!("/offers/{offer_id}/respond"),
            json!({ "driver_id": driver, "action": "accept" }),
        ),
    )
    .await;

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/orders/{order_id}/cancel"),
            json!({ "by": "customer", "customer_id": customer_id, "reason": "changed my mind" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order_status"], "cancelled");
    assert_eq!(body["cancel_reason"], "changed my mind");
    assert!(body["driver_id"].is_null());

    let (_, driver) = send(&app, get_request(&format!("/drivers/{driver}"))).await;
    assert_eq!(driver["status"], "active");
    let (_, offer) = send(&app, get_request(&format!("/offers/{offer_id}"))).await;
    assert_eq!(offer["status"], "cancelled");
    let (_, item) = send(&app, get_request(&format!("/menu-items/{item_id}"))).await;
    assert_eq!(item["quantity"], 5);
}

#[tokio::test]
async fn service_order_gets_a_driver_straight_away() {
    let app = setup();
    let driver = active_driver(&app, "eko", 1.0).await;

    let (status, ticket) = send(
        &app,
        json_request(
            "POST",
            "/service-orders",
            json!({
                "customer_id": Uuid::new_v4(),
                "description": "pick up documents",
                "pickup": { "lat": STORE.0, "lng": STORE.1 },
                "dropoff": { "lat": STORE.0 + 0.02, "lng": STORE.1 }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ticket["status"], "searching");
    let ticket_id = ticket["id"].as_str().unwrap().to_string();

    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

    let (_, ticket) = send(&app, get_request(&format!("/service-orders/{ticket_id}"))).await;
    assert_eq!(ticket["status"], "driver_found");
    assert_eq!(ticket["driver_id"], driver.as_str());
}
