mod common;

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;
use uuid::Uuid;
use yuksi_dispatch::api::rest::router;
use yuksi_dispatch::auth::Role;
use yuksi_dispatch::engine::queue::run_offer_engine;
use yuksi_dispatch::models::courier::GeoPoint;
use yuksi_dispatch::store::WatcherRepository;

use common::{Harness, harness};

fn json_request(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn post_request(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
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

async fn serve(h: &Harness) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(h.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Connects to the route socket and returns the first frame the server sends.
async fn first_route_message(addr: SocketAddr, courier_id: Uuid, token: Option<&str>) -> Message {
    let mut url = format!("ws://{addr}/ws/courier/{courier_id}/route");
    if let Some(token) = token {
        url.push_str(&format!("?token={token}"));
    }
    let (mut socket, _) = connect_async(url).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("server sends a frame")
        .unwrap()
        .unwrap()
}

fn assert_policy_close(message: Message) {
    match message {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected a policy close, got {other:?}"),
    }
}

fn order_body() -> Value {
    json!({
        "customer": "Zeynep",
        "phone": "+905551112233",
        "address": "Bağdat Cd. 1",
        "delivery_address": "Bağdat Cd. 99",
        "delivery_type": "package",
        "dropoff": { "lat": 40.02, "lng": 29.02 },
        "items": [
            { "product_name": "pide", "price": 120.0, "quantity": 2 },
            { "product_name": "ayran", "price": 15.0, "quantity": 2 }
        ]
    })
}

#[tokio::test]
async fn health_returns_ok() {
    let (h, _rx) = harness();
    let app = router(h.state.clone());
    let response = app.oneshot(get_request("/health", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], "memory");
    assert_eq!(body["route_sockets"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (h, _rx) = harness();
    let app = router(h.state.clone());
    let response = app.oneshot(get_request("/metrics", None)).await.unwrap();

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
    assert!(body.contains("orders_in_queue"));
    assert!(body.contains("orders_created_total"));
}

#[tokio::test]
async fn missing_token_returns_401() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.0, 29.0)));
    let app = router(h.state.clone());

    let response = app
        .oneshot(get_request(
            &format!("/restaurant/{restaurant}/orders"),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn other_restaurant_token_returns_403() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.0, 29.0)));
    let intruder = h.token(Uuid::new_v4(), Role::Restaurant);
    let app = router(h.state.clone());

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/restaurant/{restaurant}/orders"),
            &intruder,
            order_body(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.store.order_count(), 0);
}

#[tokio::test]
async fn courier_token_cannot_create_orders() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.0, 29.0)));
    let courier_token = h.token(restaurant, Role::Courier);
    let app = router(h.state.clone());

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/restaurant/{restaurant}/orders"),
            &courier_token,
            order_body(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_order_returns_422() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.0, 29.0)));
    let token = h.token(restaurant, Role::Restaurant);
    let app = router(h.state.clone());

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/restaurant/{restaurant}/orders"),
            &token,
            json!({ "customer": "Zeynep", "delivery_type": "teleport" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn mismatched_amount_returns_422() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.0, 29.0)));
    let token = h.token(restaurant, Role::Restaurant);
    let app = router(h.state.clone());

    let mut body = order_body();
    body["amount"] = json!(999.0);
    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/restaurant/{restaurant}/orders"),
            &token,
            body,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn unknown_order_is_reported_in_envelope() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.0, 29.0)));
    let token = h.token(restaurant, Role::Restaurant);
    let app = router(h.state.clone());

    let response = app
        .oneshot(get_request(
            &format!("/restaurant/{restaurant}/orders/{}", Uuid::new_v4()),
            Some(&token),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn admin_removes_pool_entry() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(None);
    let order = h
        .dispatch_order(restaurant, Some(GeoPoint::new(40.0, 29.0)))
        .await;
    assert_eq!(h.store.pool_len(), 1);
    let app = router(h.state.clone());

    let restaurant_token = h.token(restaurant, Role::Restaurant);
    let refused = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/admin/pool/{}", order.id))
                .header("authorization", format!("Bearer {restaurant_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(refused.status(), StatusCode::FORBIDDEN);

    let admin_token = h.token(Uuid::new_v4(), Role::Admin);
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/admin/pool/{}", order.id))
                .header("authorization", format!("Bearer {admin_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Pool entry removed");
    assert_eq!(body["data"]["status"], "cancelled");
    assert_eq!(h.store.pool_len(), 0);
    assert!(h.store.watcher(order.id).await.unwrap().is_none());
}

#[tokio::test]
async fn order_flow_from_creation_to_delivery() {
    let (h, rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let c1 = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let c2 = h.courier(Some(GeoPoint::new(40.002, 29.002)), true).await;
    let restaurant_token = h.token(restaurant, Role::Restaurant);
    let c1_token = h.token(c1, Role::Courier);
    let c2_token = h.token(c2, Role::Courier);

    tokio::spawn(run_offer_engine(h.state.clone(), rx));
    let app = router(h.state.clone());

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/restaurant/{restaurant}/orders"),
            &restaurant_token,
            order_body(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Order created");
    assert_eq!(body["data"]["status"], "preparing");
    assert_eq!(body["data"]["amount"], 270.0);
    assert_eq!(body["data"]["pickup"]["lat"], 40.0);
    let order_id = body["data"]["id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = app
        .clone()
        .oneshot(get_request(&format!("/courier/{c1}/offers"), Some(&c1_token)))
        .await
        .unwrap();
    let body = body_json(response).await;
    let offers = body["data"].as_array().unwrap();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0]["id"], order_id.as_str());
    assert_eq!(offers[0]["status"], "offered");

    let response = app
        .clone()
        .oneshot(post_request(
            &format!("/courier/{c1}/orders/{order_id}/accept"),
            &c1_token,
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "assigned");
    assert_eq!(body["data"]["courier_id"], c1.to_string());

    let response = app
        .clone()
        .oneshot(post_request(
            &format!("/courier/{c2}/orders/{order_id}/accept"),
            &c2_token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Order already assigned");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/courier/{c1}/gps"),
            &c1_token,
            json!({ "lat": 40.0012, "lng": 29.0012 }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["message"], "Location updated");

    let response = app
        .clone()
        .oneshot(get_request(
            &format!("/restaurant/{restaurant}/orders/{order_id}/courier-gps"),
            Some(&restaurant_token),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["courier_id"], c1.to_string());
    assert_eq!(body["data"]["location"]["lat"], 40.0012);

    for (step, status) in [("pickup", "en_route"), ("deliver", "delivered")] {
        let response = app
            .clone()
            .oneshot(post_request(
                &format!("/courier/{c1}/orders/{order_id}/{step}"),
                &c1_token,
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["success"], true, "{step}");
        assert_eq!(body["data"]["status"], status);
    }

    let response = app
        .clone()
        .oneshot(get_request(
            &format!("/courier/{c2}/orders-log?action=accept"),
            Some(&c2_token),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["items"][0]["order_id"], order_id.as_str());

    let response = app
        .oneshot(get_request(
            &format!("/restaurant/{restaurant}/orders/history"),
            Some(&restaurant_token),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["items"][0]["status"], "delivered");
}

#[tokio::test]
async fn route_socket_refuses_another_couriers_token() {
    let (h, _rx) = harness();
    let courier = h.courier(Some(GeoPoint::new(40.0, 29.0)), true).await;
    let other = h.courier(Some(GeoPoint::new(40.0, 29.0)), true).await;
    let addr = serve(&h).await;

    let token = h.token(other, Role::Courier);
    assert_policy_close(first_route_message(addr, courier, Some(&token)).await);
}

#[tokio::test]
async fn route_socket_refuses_missing_token() {
    let (h, _rx) = harness();
    let courier = h.courier(Some(GeoPoint::new(40.0, 29.0)), true).await;
    let addr = serve(&h).await;

    assert_policy_close(first_route_message(addr, courier, None).await);
}

#[tokio::test]
async fn route_socket_sends_route_on_connect_and_answers_ping() {
    let (h, _rx) = harness();
    let restaurant = h.restaurant(Some(GeoPoint::new(40.000, 29.000)));
    let courier = h.courier(Some(GeoPoint::new(40.001, 29.001)), true).await;
    let order = h.dispatch_order(restaurant, None).await;
    h.state.offers.courier_accept(courier, order.id).await.unwrap();
    let addr = serve(&h).await;

    let token = h.token(courier, Role::Courier);
    let url = format!("ws://{addr}/ws/courier/{courier}/route?token={token}");
    let (mut socket, _) = connect_async(url).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("route frame on connect")
        .unwrap()
        .unwrap();
    let Message::Text(text) = first else {
        panic!("expected a text frame, got {first:?}");
    };
    let frame: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(frame["type"], "route_update");
    assert_eq!(frame["order_id"], order.id.to_string());

    socket.send(Message::Text("ping".to_string())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("pong reply")
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Text("pong".to_string()));
}
