//! End-to-end integration tests for SigRPC.
//!
//! These tests verify complete flows work correctly:
//! - Calls, notifications and errors over an in-memory channel
//! - Reply correlation under concurrency, timeouts and close
//! - Peer authentication on duplex and one-shot carriers
//! - Round trips over TCP, Unix sockets and HTTP with both codecs

use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::{Authenticator, CodecKind, ErrorCode, Identity, Kwargs, TrustPolicy, Value};
use rpc::dispatcher::{Dispatcher, HandlerError, NotificationFailure, ParamSpec, Params};
use rpc::transport::http::DEFAULT_MAX_BODY_SIZE;
use rpc::transport::{
    Channel, ChannelOptions, HttpClientCarrier, HttpServerCarrier, MemoryCarrier, StreamCarrier,
    StreamListener,
};
use rpc::{ClientConfig, RpcClient, RpcError, RpcServer, ServerConfig};
use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinSet;

/// Server and client authenticators that pin each other.
fn pinned_pair() -> (Arc<Authenticator>, Arc<Authenticator>) {
    let server = Identity::generate();
    let client = Identity::generate();
    let server_auth = Authenticator::new(
        server.clone(),
        TrustPolicy::pinned(client.to_peer_identity()),
    );
    let client_auth = Authenticator::new(client, TrustPolicy::pinned(server.to_peer_identity()));
    (Arc::new(server_auth), Arc::new(client_auth))
}

fn test_dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();

    dispatcher
        .register("add", ParamSpec::new().required("a").required("b"), |p: Params| async move {
            let a: i64 = p.get(0, "a")?;
            let b: i64 = p.get(1, "b")?;
            Ok::<_, HandlerError>(json!(a + b))
        })
        .unwrap();

    dispatcher
        .register(
            "delay",
            ParamSpec::new().required("ms").optional("tag"),
            |p: Params| async move {
                let ms: u64 = p.get(0, "ms")?;
                let tag: Option<Value> = p.opt(1, "tag")?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, HandlerError>(tag.unwrap_or(Value::Null))
            },
        )
        .unwrap();

    dispatcher
        .register("fail", ParamSpec::new(), |_p: Params| async move {
            Err::<Value, _>(HandlerError::application_with_data(
                "out of widgets",
                json!({"left": 0}),
            ))
        })
        .unwrap();

    dispatcher
        .register("echo", ParamSpec::any(), |p: Params| async move {
            Ok::<_, HandlerError>(json!({"args": p.args(), "kwargs": p.kwargs()}))
        })
        .unwrap();

    dispatcher
        .register_notification("boom", ParamSpec::any(), |_p: Params| async move {
            Err::<(), _>(HandlerError::application("notification handler failed"))
        })
        .unwrap();

    dispatcher
        .register_notification("log", ParamSpec::new().required("message"), |_p: Params| async move {
            Ok::<_, HandlerError>(())
        })
        .unwrap();

    dispatcher
}

/// Connect a client to a server over an in-memory duplex channel.
async fn connect_memory(dispatcher: Dispatcher, codec: CodecKind) -> (Arc<RpcClient>, RpcServer) {
    let (server_auth, client_auth) = pinned_pair();
    let (near, far) = MemoryCarrier::pair();

    let server = RpcServer::new(dispatcher, codec.build(), ServerConfig::default());
    let serving = server.clone();
    tokio::spawn(async move {
        if let Ok(channel) = Channel::open(far, server_auth, ChannelOptions::default()).await {
            serving.serve_channel(channel).await;
        }
    });

    let channel = Channel::open(near, client_auth, ChannelOptions::default())
        .await
        .unwrap();
    let client = RpcClient::new(channel, codec.build(), ClientConfig::default());
    (Arc::new(client), server)
}

fn assert_remote(result: Result<Value, RpcError>, expected: ErrorCode) {
    match result {
        Err(e) => assert_eq!(e.kind(), Some(expected), "unexpected error: {}", e),
        Ok(value) => panic!("expected {:?}, got {}", expected, value),
    }
}

// =============================================================================
// Call Semantics
// =============================================================================

#[tokio::test]
async fn test_add_and_unknown_method() {
    let (client, _server) = connect_memory(test_dispatcher(), CodecKind::Json).await;

    let sum = client.call("add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(sum, json!(5));

    let missing = client.call("nope", vec![]).await;
    match missing {
        Err(RpcError::Remote { code, message, .. }) => {
            assert_eq!(code, ErrorCode::MethodNotFound.code());
            assert!(message.contains("nope"));
        }
        other => panic!("expected MethodNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_named_arguments_over_msgpack() {
    let (client, _server) = connect_memory(test_dispatcher(), CodecKind::Msgpack).await;

    let mut kwargs = Kwargs::new();
    kwargs.insert("a".to_string(), json!(40));
    kwargs.insert("b".to_string(), json!(2));
    assert_eq!(client.call_kwargs("add", kwargs).await.unwrap(), json!(42));

    let mut kwargs = Kwargs::new();
    kwargs.insert("k".to_string(), json!([1, "two", null]));
    let echoed = client.call_kwargs("echo", kwargs).await.unwrap();
    assert_eq!(echoed, json!({"args": [], "kwargs": {"k": [1, "two", null]}}));
}

#[tokio::test]
async fn test_parameter_errors() {
    let (client, _server) = connect_memory(test_dispatcher(), CodecKind::Json).await;

    assert_remote(
        client.call("add", vec![json!(1)]).await,
        ErrorCode::InvalidParams,
    );
    assert_remote(
        client.call("add", vec![json!("1"), json!(2)]).await,
        ErrorCode::InvalidParams,
    );
}

#[tokio::test]
async fn test_application_error_carries_data() {
    let (client, _server) = connect_memory(test_dispatcher(), CodecKind::Json).await;

    match client.call("fail", vec![]).await {
        Err(RpcError::Remote {
            code,
            message,
            data,
        }) => {
            assert_eq!(code, ErrorCode::ApplicationError.code());
            assert_eq!(message, "out of widgets");
            assert_eq!(data, Some(json!({"left": 0})));
        }
        other => panic!("expected application error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_calls_complete_out_of_order() {
    let (client, _server) = connect_memory(test_dispatcher(), CodecKind::Json).await;
    let mut calls = JoinSet::new();

    for i in 0..8u64 {
        let client = client.clone();
        calls.spawn(async move {
            let delay = (8 - i) * 25;
            let tag = client
                .call("delay", vec![json!(delay), json!(i)])
                .await
                .unwrap();
            (i, tag)
        });
    }

    let mut finished = Vec::new();
    while let Some(joined) = calls.join_next().await {
        let (i, tag) = joined.unwrap();
        assert_eq!(tag, json!(i));
        finished.push(i);
    }

    assert_eq!(finished.len(), 8);
    assert_eq!(finished[0], 7);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_timeout_discards_late_reply() {
    let (client, _server) = connect_memory(test_dispatcher(), CodecKind::Json).await;

    let slow = client
        .call_with_timeout("delay", vec![json!(200), json!("late")], Duration::from_millis(30))
        .await;
    match slow {
        Err(RpcError::Timeout { method, after }) => {
            assert_eq!(method, "delay");
            assert_eq!(after, Duration::from_millis(30));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(client.pending_calls(), 0);

    // Let the late reply arrive and be dropped
    tokio::time::sleep(Duration::from_millis(300)).await;

    let tag = client
        .call("delay", vec![json!(1), json!("fresh")])
        .await
        .unwrap();
    assert_eq!(tag, json!("fresh"));
}

#[tokio::test]
async fn test_notification_failure_reaches_only_the_hook() {
    let failures: Arc<Mutex<Vec<NotificationFailure>>> = Arc::new(Mutex::new(Vec::new()));
    let mut dispatcher = test_dispatcher();
    let sink = failures.clone();
    dispatcher.set_notification_hook(Arc::new(move |failure| {
        sink.lock().unwrap().push(failure.clone());
    }));

    let (client, _server) = connect_memory(dispatcher, CodecKind::Json).await;

    client.notify("boom", vec![]).await.unwrap();
    client.notify("missing", vec![]).await.unwrap();
    client.notify("log", vec![json!("fine")]).await.unwrap();

    // The channel stays usable and no stray reply confuses the next call
    assert_eq!(
        client.call("add", vec![json!(1), json!(1)]).await.unwrap(),
        json!(2)
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while failures.lock().unwrap().len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut seen = failures.lock().unwrap().clone();
    seen.sort_by(|a, b| a.method.cmp(&b.method));
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].method, "boom");
    assert_eq!(seen[0].code, ErrorCode::ApplicationError);
    assert_eq!(seen[1].method, "missing");
    assert_eq!(seen[1].code, ErrorCode::MethodNotFound);
}

#[tokio::test]
async fn test_close_fails_every_pending_call() {
    let (client, _server) = connect_memory(test_dispatcher(), CodecKind::Json).await;
    let mut calls = JoinSet::new();

    for _ in 0..3 {
        let client = client.clone();
        calls.spawn(async move { client.call("delay", vec![json!(5_000)]).await });
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.pending_calls() < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(client.pending_calls(), 3);

    client.close().await.unwrap();

    while let Some(joined) = calls.join_next().await {
        assert!(matches!(joined.unwrap(), Err(RpcError::ChannelClosed)));
    }
    assert_eq!(client.pending_calls(), 0);
    assert!(matches!(
        client.call("add", vec![json!(1), json!(2)]).await,
        Err(RpcError::ChannelClosed)
    ));
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_untrusted_peer_fails_handshake() {
    let (server_auth, _) = pinned_pair();
    let stranger = Arc::new(Authenticator::new(
        Identity::generate(),
        TrustPolicy::first_seen(),
    ));
    let (near, far) = MemoryCarrier::pair();

    let (server_side, client_side) = tokio::join!(
        Channel::open(far, server_auth, ChannelOptions::default()),
        Channel::open(near, stranger, ChannelOptions::default()),
    );

    assert!(server_side.is_err());
    assert!(client_side.is_err());
}

#[tokio::test]
async fn test_allow_list_admits_listed_clients() {
    let server_id = Identity::generate();
    let alice = Identity::generate();
    let bob = Identity::generate();
    let server_auth = Arc::new(Authenticator::new(
        server_id.clone(),
        TrustPolicy::allow_list([alice.to_peer_identity(), bob.to_peer_identity()]),
    ));

    for client_id in [alice, bob] {
        let (near, far) = MemoryCarrier::pair();
        let client_auth = Arc::new(Authenticator::new(
            client_id.clone(),
            TrustPolicy::pinned(server_id.to_peer_identity()),
        ));

        let (server_side, client_side) = tokio::join!(
            Channel::open(far, server_auth.clone(), ChannelOptions::default()),
            Channel::open(near, client_auth, ChannelOptions::default()),
        );

        let server_side = server_side.unwrap();
        assert_eq!(server_side.peer(), Some(&client_id.to_peer_identity()));
        assert_eq!(
            client_side.unwrap().peer(),
            Some(&server_id.to_peer_identity())
        );
    }
}

// =============================================================================
// Carriers
// =============================================================================

async fn stream_roundtrip(endpoint: &str, codec: CodecKind) {
    let (server_auth, client_auth) = pinned_pair();
    let listener = StreamListener::bind(endpoint).await.unwrap();
    let endpoint = listener.local_endpoint().unwrap();

    let server = RpcServer::new(test_dispatcher(), codec.build(), ServerConfig::default());
    let serving = server.clone();
    let task = tokio::spawn(async move {
        serving
            .serve_listener(listener, move || server_auth.clone())
            .await
    });

    let carrier = StreamCarrier::connect(&endpoint).await.unwrap();
    let channel = Channel::open(carrier, client_auth, ChannelOptions::default())
        .await
        .unwrap();
    let client = RpcClient::new(channel, codec.build(), ClientConfig::default());

    assert_eq!(
        client.call("add", vec![json!(2), json!(3)]).await.unwrap(),
        json!(5)
    );
    let big = "y".repeat(64 * 1024);
    assert_eq!(
        client
            .call("delay", vec![json!(0), json!(big.clone())])
            .await
            .unwrap(),
        json!(big)
    );
    assert_remote(client.call("nope", vec![]).await, ErrorCode::MethodNotFound);
    client.notify("log", vec![json!("over the wire")]).await.unwrap();

    client.close().await.unwrap();
    server.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_tcp_roundtrip_json() {
    stream_roundtrip("127.0.0.1:0", CodecKind::Json).await;
}

#[tokio::test]
async fn test_tcp_roundtrip_msgpack() {
    stream_roundtrip("127.0.0.1:0", CodecKind::Msgpack).await;
}

#[tokio::test]
async fn test_unix_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let endpoint = format!("unix:{}", temp_dir.path().join("rpc.sock").display());
    stream_roundtrip(&endpoint, CodecKind::Msgpack).await;
}

async fn start_http(
    codec: CodecKind,
    server_auth: Arc<Authenticator>,
) -> (String, RpcServer, tokio::task::JoinHandle<()>) {
    let carrier = HttpServerCarrier::bind("127.0.0.1:0", DEFAULT_MAX_BODY_SIZE)
        .await
        .unwrap();
    let url = format!("http://{}/rpc", carrier.local_addr());

    let server = RpcServer::new(test_dispatcher(), codec.build(), ServerConfig::default());
    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve_http(carrier, server_auth).await });
    (url, server, task)
}

async fn http_client(url: &str, auth: Arc<Authenticator>, codec: CodecKind) -> RpcClient {
    let channel = Channel::open(
        HttpClientCarrier::new(url.to_string()),
        auth,
        ChannelOptions::default(),
    )
    .await
    .unwrap();
    RpcClient::new(
        channel,
        codec.build(),
        ClientConfig {
            default_timeout: Duration::from_secs(5),
        },
    )
}

#[tokio::test]
async fn test_http_roundtrip_both_codecs() {
    for codec in [CodecKind::Json, CodecKind::Msgpack] {
        let (server_auth, client_auth) = pinned_pair();
        let (url, server, task) = start_http(codec, server_auth).await;
        let client = http_client(&url, client_auth, codec).await;

        assert_eq!(
            client.call("add", vec![json!(2), json!(3)]).await.unwrap(),
            json!(5)
        );
        assert_remote(client.call("nope", vec![]).await, ErrorCode::MethodNotFound);
        client.notify("log", vec![json!("posted")]).await.unwrap();
        assert_eq!(
            client.call("add", vec![json!(20), json!(22)]).await.unwrap(),
            json!(42)
        );

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_http_untrusted_client_gets_no_answer() {
    let (server_auth, _) = pinned_pair();
    let (url, server, _task) = start_http(CodecKind::Json, server_auth.clone()).await;

    let stranger = Arc::new(Authenticator::new(
        Identity::generate(),
        TrustPolicy::pinned(server_auth.identity().to_peer_identity()),
    ));
    let client = http_client(&url, stranger, CodecKind::Json).await;

    let result = client
        .call_with_timeout("add", vec![json!(1), json!(2)], Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(RpcError::Timeout { .. })));

    server.shutdown();
}

#[tokio::test]
async fn test_http_first_seen_locks_to_first_client() {
    let server_id = Identity::generate();
    let server_auth = Arc::new(Authenticator::new(
        server_id.clone(),
        TrustPolicy::first_seen(),
    ));
    let (url, server, _task) = start_http(CodecKind::Json, server_auth.clone()).await;

    let client_for = |identity: Identity| {
        Arc::new(Authenticator::new(
            identity,
            TrustPolicy::pinned(server_id.to_peer_identity()),
        ))
    };

    let first_id = Identity::generate();
    let first = http_client(&url, client_for(first_id.clone()), CodecKind::Json).await;
    assert_eq!(
        first.call("add", vec![json!(1), json!(1)]).await.unwrap(),
        json!(2)
    );
    assert_eq!(
        server_auth.policy().recorded(),
        Some(first_id.to_peer_identity())
    );

    let second = http_client(&url, client_for(Identity::generate()), CodecKind::Json).await;
    let result = second
        .call_with_timeout("add", vec![json!(1), json!(1)], Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(RpcError::Timeout { .. })));

    server.shutdown();
}
