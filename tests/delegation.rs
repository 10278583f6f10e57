//! Two submission nodes and a stand-in dispatcher on ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::post, Router};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use smsgw::config::WisConfig;
use smsgw::delivery::InMemoryMessageStore;
use smsgw::transport::NodeClient;
use smsgw::types::{Message, MessageStatus, ModemRegistration, Submission};
use smsgw::wire::ManageModem;
use smsgw::wis::WisNode;
use smsgw::Codec;

const KEY: &str = "integration-secret";

async fn spawn_wis(node_id: &str, peers: Vec<String>, token: &CancellationToken) -> (Arc<WisNode>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let config = WisConfig {
        node_id: node_id.to_string(),
        public_url: url.clone(),
        peers,
        http_timeout_secs: 2,
        delivery_timeout_secs: 5,
        ..WisConfig::default()
    };
    let node = WisNode::new(
        &config,
        86_400,
        Arc::new(InMemoryMessageStore::new()),
        Codec::new(KEY),
        token.clone(),
    )
    .unwrap();
    node.start();
    tokio::spawn(node.clone().serve(listener));
    (node, url)
}

#[derive(Clone)]
struct FakeDispatcher {
    codec: Codec,
    answer: StatusCode,
    received: Arc<Mutex<Vec<String>>>,
}

async fn fake_send(State(state): State<FakeDispatcher>, body: String) -> StatusCode {
    let msg: Message = state.codec.decode(&body).unwrap();
    state.received.lock().push(msg.id);
    state.answer
}

async fn spawn_dispatcher(answer: StatusCode) -> (FakeDispatcher, String) {
    let state = FakeDispatcher {
        codec: Codec::new(KEY),
        answer,
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/sendsms", post(fake_send))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(listener, app).await });
    (state, url)
}

fn client() -> NodeClient {
    NodeClient::new(Codec::new(KEY), Duration::from_secs(2), Duration::from_secs(5)).unwrap()
}

fn registration(modem_id: &str, route_id: &str, delivery_url: &str) -> ManageModem {
    ManageModem::Register(ModemRegistration {
        modem_id: modem_id.to_string(),
        number_pattern: "^\\+43".to_string(),
        label: modem_id.to_string(),
        load_factor: 1,
        delivery_url: delivery_url.to_string(),
        route_id: route_id.to_string(),
    })
}

async fn wait_for_status(node: &WisNode, id: &str, wanted: MessageStatus) -> bool {
    for _ in 0..100 {
        if let Ok(Some(msg)) = node.messages().get(id).await {
            if msg.status == wanted {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_message_is_delegated_to_owning_node() {
    let token = CancellationToken::new();
    let (origin, origin_url) = spawn_wis("wis1", vec![], &token).await;
    let (owner, owner_url) = spawn_wis("wis2", vec![origin_url.clone()], &token).await;
    let (dispatcher, dispatcher_url) = spawn_dispatcher(StatusCode::OK).await;
    let client = client();

    // the owner learns the modem and gossips it to the origin right away
    let code = client
        .manage_modem(&owner_url, &registration("m-remote", "r1", &dispatcher_url))
        .await;
    assert_eq!(code, 200);
    for _ in 0..100 {
        if !origin.routes().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let learned = origin.routes().read();
    assert_eq!(learned.len(), 1);
    assert_eq!(learned[0].owner_node_id, "wis2");
    assert_eq!(learned[0].owner_routing_url, owner_url);

    let receipt = client
        .submit(
            &origin_url,
            &Submission {
                target_number: "0043660111".to_string(),
                content: "hello".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.modem_id, "m-remote");
    assert_eq!(receipt.status, MessageStatus::New);

    assert!(wait_for_status(&origin, &receipt.id, MessageStatus::DelegateOk).await);
    assert!(wait_for_status(&owner, &receipt.id, MessageStatus::SentDelegatedOk).await);
    assert_eq!(dispatcher.received.lock().clone(), vec![receipt.id.clone()]);

    let history = client.history(&owner_url, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].target_number, "+43660111");

    token.cancel();
}

#[tokio::test]
async fn test_refused_local_dispatch_is_no_route() {
    let token = CancellationToken::new();
    let (node, url) = spawn_wis("wis1", vec![], &token).await;
    let (_dispatcher, dispatcher_url) = spawn_dispatcher(StatusCode::INTERNAL_SERVER_ERROR).await;
    let client = client();

    assert_eq!(
        client
            .manage_modem(&url, &registration("m-local", "r1", &dispatcher_url))
            .await,
        200
    );
    let receipt = client
        .submit(
            &url,
            &Submission {
                target_number: "+43660".to_string(),
                content: "hello".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(wait_for_status(&node, &receipt.id, MessageStatus::NoRoute).await);
    token.cancel();
}

#[tokio::test]
async fn test_api_edges() {
    let token = CancellationToken::new();
    let (node, url) = spawn_wis("wis1", vec![], &token).await;
    let client = client();
    let http = reqwest::Client::new();

    // undecodable body
    let response = http
        .post(format!("{}/smsgateway/api/heartbeat", url))
        .body("not a token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // heartbeat for a route nobody registered
    assert_eq!(client.heartbeat(&url, "nope").await, 400);

    // legacy submission without any route
    let body = http
        .get(format!("{}/smsgateway/sendsms?mobile=0043660&content=hi", url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("<returnCode>ERR0001</returnCode>"));
    let stored = node.messages().list().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MessageStatus::NoRoute);
    assert_eq!(stored[0].modem_id, "NoRoutes");

    let status = client.router_status(&url).await.unwrap();
    assert_eq!(status.router, "alive");
    assert_eq!(status.watchdog, "alive");

    client.wake_watchdog(&url).await.unwrap();
    client.probe(&url).await.unwrap();

    token.cancel();
}

#[tokio::test]
async fn test_unregister_withdraws_route() {
    let token = CancellationToken::new();
    let (node, url) = spawn_wis("wis1", vec![], &token).await;
    let client = client();

    assert_eq!(
        client
            .manage_modem(&url, &registration("m1", "r1", "http://127.0.0.1:9"))
            .await,
        200
    );
    assert_eq!(client.heartbeat(&url, "r1").await, 200);

    let unregister = ManageModem::Unregister {
        route_id: "r1".to_string(),
    };
    assert_eq!(client.manage_modem(&url, &unregister).await, 200);
    assert_eq!(node.routes().read()[0].obsolescence, 14);
    // a withdrawn route cannot be revived by heartbeats
    assert_eq!(client.heartbeat(&url, "r1").await, 400);

    token.cancel();
}
