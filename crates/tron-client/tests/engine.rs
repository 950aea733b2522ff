use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tron_client::mock::{MockDialer, MockListener, MockPeer};
use tron_client::{
    Address, AuthorizationHandler, ClientConfig, ClientError, ConnectionState, DaemonClient,
    Frame, FrameKind, QuestionHandler, TimeoutKind, Transcript,
};
use tron_core::ids::SessionId;
use tron_core::payloads::{
    AuthorizationDecision, AuthorizationRequest, AuthorizationResponse, CloseRequest,
    QuestionAnswer, QuestionRequest, QuestionResponse,
};

fn config() -> ClientConfig {
    let mut config = ClientConfig::new(Address::Tcp("mock:0".into()));
    config.connect_timeout = Duration::from_secs(1);
    config.request_timeout = Duration::from_secs(2);
    config.heartbeat_interval = Duration::ZERO;
    config.reconnect.base_delay = Duration::from_millis(10);
    config.reconnect.max_delay = Duration::from_millis(40);
    config
}

async fn connected(config: ClientConfig) -> (DaemonClient, MockDialer, MockListener, MockPeer) {
    let (dialer, mut listener) = MockDialer::new();
    let client = DaemonClient::with_dialer(config, Arc::new(dialer.clone()));
    let (res, peer) = tokio::join!(client.connect(), listener.accept_ready());
    res.unwrap();
    (client, dialer, listener, peer.unwrap())
}

async fn wait_for_state(client: &DaemonClient, want: ConnectionState) {
    let mut rx = client.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

async fn recv(peer: &mut MockPeer) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), peer.recv_request())
        .await
        .expect("timed out waiting for frame")
        .expect("peer stream ended")
}

#[tokio::test]
async fn handshake_carries_identity_and_token() {
    let (dialer, mut listener) = MockDialer::new();
    let config = config()
        .with_identity("tron-test", "9.9.9")
        .with_token("t0ken");
    let client = DaemonClient::with_dialer(config, Arc::new(dialer));

    let server = async {
        let mut peer = listener.accept().await.unwrap();
        let hello = peer.accept_handshake().await.unwrap();
        (peer, hello)
    };
    let (res, (_peer, hello)) = tokio::join!(client.connect(), server);
    res.unwrap();

    assert_eq!(hello.client_name, "tron-test");
    assert_eq!(hello.client_version, "9.9.9");
    assert_eq!(hello.token.as_deref(), Some("t0ken"));
    assert!(hello.capabilities.contains(&"authorization".to_string()));
    assert_eq!(client.state(), ConnectionState::Connected);
    client.close().await;
}

#[tokio::test]
async fn rejected_handshake_is_authentication_error() {
    let (dialer, mut listener) = MockDialer::new();
    let client = DaemonClient::with_dialer(config(), Arc::new(dialer.clone()));

    let server = async {
        let mut peer = listener.accept().await.unwrap();
        peer.reject_handshake("bad token").await;
        peer
    };
    let (res, _peer) = tokio::join!(client.connect(), server);

    match res {
        Err(ClientError::Authentication(msg)) => assert_eq!(msg, "bad token"),
        other => panic!("expected authentication error, got {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn connect_twice_is_invalid_state() {
    let (client, _dialer, _listener, _peer) = connected(config()).await;
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)));
    assert_eq!(client.state(), ConnectionState::Connected);
    client.close().await;
}

#[tokio::test]
async fn stalled_dial_is_connect_timeout() {
    let (dialer, _listener) = MockDialer::new();
    dialer.stall(true);
    let mut config = config();
    config.connect_timeout = Duration::from_millis(50);
    let client = DaemonClient::with_dialer(config, Arc::new(dialer));

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Connect));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn requests_before_connect_are_not_connected() {
    let (dialer, _listener) = MockDialer::new();
    let client = DaemonClient::with_dialer(config(), Arc::new(dialer));
    let err = client
        .send_request(Frame::new(FrameKind::SessionList, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn concurrent_requests_get_their_own_responses() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;

    let mut callers = Vec::new();
    for i in 0..20u64 {
        let client = client.clone();
        callers.push(tokio::spawn(async move {
            let response = client
                .send_request(Frame::new(FrameKind::SessionList, json!({ "n": i })))
                .await
                .unwrap();
            (i, response.data["n"].as_u64().unwrap())
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..20 {
        requests.push(recv(&mut peer).await);
    }
    for request in requests.iter().rev() {
        let n = request.data["n"].clone();
        peer.reply(request, json!({ "n": n })).await.unwrap();
    }

    for caller in callers {
        let (sent, got) = caller.await.unwrap();
        assert_eq!(sent, got);
    }
    assert_eq!(client.pending_requests(), 0);
    client.close().await;
}

#[tokio::test]
async fn error_block_becomes_server_error() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;

    let call = client.attach_session(SessionId::from_raw("sess_missing"));
    let server = async {
        let request = recv(&mut peer).await;
        assert_eq!(request.kind, FrameKind::SessionAttach);
        peer.reply_error(&request, "SESSION_NOT_FOUND", "no such session")
            .await
            .unwrap();
    };
    let (res, ()) = tokio::join!(call, server);

    match res {
        Err(ClientError::Server { code, message, .. }) => {
            assert_eq!(code, "SESSION_NOT_FOUND");
            assert_eq!(message, "no such session");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    assert!(client.current_session().session_id.is_none());
    assert_eq!(client.stats().snapshot().server_errors, 1);
    client.close().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let mut config = config();
    config.request_timeout = Duration::from_millis(50);
    let (client, _dialer, _listener, _peer) = connected(config).await;

    let err = client
        .send_request(Frame::new(FrameKind::WorkspaceList, json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Request));
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.state(), ConnectionState::Connected);
    client.close().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_disconnecting() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;

    let call = client.list_workspaces();
    let server = async {
        let request = recv(&mut peer).await;
        peer.send_raw("{this is not json").await.unwrap();
        peer.reply(&request, json!({"workspaces": [{"path": "/src/tron"}]}))
            .await
            .unwrap();
    };
    let (res, ()) = tokio::join!(call, server);

    let workspaces = res.unwrap();
    assert_eq!(workspaces.len(), 1);
    assert_eq!(client.stats().snapshot().frames_dropped, 1);
    assert_eq!(client.state(), ConnectionState::Connected);
    client.close().await;
}

#[tokio::test]
async fn sends_after_close_fail_without_writing() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;
    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);

    let err = client
        .send_request(Frame::new(FrameKind::SessionList, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Closed));
    let err = client
        .send_message(Frame::new(FrameKind::Ping, json!(null)))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Closed));

    // The daemon sees EOF and nothing else.
    let next = tokio::time::timeout(Duration::from_secs(1), peer.recv())
        .await
        .unwrap();
    assert!(next.is_none());

    // Idempotent.
    client.close().await;
    assert!(matches!(client.connect().await, Err(ClientError::Closed)));
}

#[tokio::test]
async fn close_fails_in_flight_requests() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_request(Frame::new(FrameKind::SessionList, json!({})))
                .await
        })
    };
    recv(&mut peer).await;
    client.close().await;

    let res = waiter.await.unwrap();
    assert!(matches!(res, Err(ClientError::Closed)));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn disconnect_asks_daemon_to_preserve_session() {
    let mut config = config();
    config.disconnect_grace = Duration::from_millis(100);
    let (client, dialer, _listener, mut peer) = connected(config).await;

    let server = async {
        let request = recv(&mut peer).await;
        assert_eq!(request.kind, FrameKind::Close);
        let close: CloseRequest = request.payload().unwrap();
        assert!(close.preserve_session);
        // No acknowledgement: the grace window must bound the wait.
    };
    tokio::join!(client.disconnect(), server);

    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(!client.reconnect_enabled());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn reconnects_and_restores_session_once() {
    let (client, dialer, mut listener, mut peer) = connected(config()).await;

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = attempts.clone();
    client
        .callbacks()
        .on_reconnecting(move |notice| seen.lock().push(notice.attempt));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    client.callbacks().on_reconnected(move |()| {
        let _ = done_tx.send(());
    });

    let create = client.create_session(None);
    let server = async {
        let request = recv(&mut peer).await;
        assert_eq!(request.kind, FrameKind::SessionCreate);
        peer.reply(&request, json!({"session_id": "sess_abc"}))
            .await
            .unwrap();
    };
    let (created, ()) = tokio::join!(create, server);
    assert_eq!(created.unwrap().session_id.as_str(), "sess_abc");

    dialer.fail_next(2);
    drop(peer);

    let mut peer = tokio::time::timeout(Duration::from_secs(5), listener.accept_ready())
        .await
        .unwrap()
        .unwrap();
    let attach = recv(&mut peer).await;
    assert_eq!(attach.kind, FrameKind::SessionAttach);
    assert_eq!(attach.data["session_id"], "sess_abc");
    peer.reply(&attach, json!({"session_id": "sess_abc"}))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.reconnect_attempts(), 0);
    assert_eq!(dialer.dial_count(), 4);
    assert_eq!(*attempts.lock(), vec![1, 2, 3]);
    assert_eq!(
        client.current_session().session_id,
        Some(SessionId::from_raw("sess_abc"))
    );

    // The next thing on the wire is our ping, not a second attach.
    let ping = {
        let client = client.clone();
        tokio::spawn(async move { client.ping().await })
    };
    let next = recv(&mut peer).await;
    assert_eq!(next.kind, FrameKind::Ping);
    peer.reply(&next, json!(null)).await.unwrap();
    ping.await.unwrap().unwrap();

    client.close().await;
}

#[tokio::test]
async fn failed_replay_clears_session() {
    let (client, _dialer, mut listener, mut peer) = connected(config()).await;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    client.callbacks().on_reconnected(move |()| {
        let _ = done_tx.send(());
    });

    let create = client.create_session(Some("/src/tron".into()));
    let server = async {
        let request = recv(&mut peer).await;
        peer.reply(
            &request,
            json!({"session_id": "sess_gone", "workspace": "/src/tron"}),
        )
        .await
        .unwrap();
    };
    let (created, ()) = tokio::join!(create, server);
    created.unwrap();

    drop(peer);
    let mut peer = listener.accept_ready().await.unwrap();

    let attach = recv(&mut peer).await;
    assert_eq!(attach.kind, FrameKind::SessionAttach);
    peer.reply_error(&attach, "SESSION_NOT_FOUND", "expired")
        .await
        .unwrap();

    let set = recv(&mut peer).await;
    assert_eq!(set.kind, FrameKind::WorkspaceSet);
    assert_eq!(set.data["path"], "/src/tron");
    peer.reply(&set, json!({})).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let session = client.current_session();
    assert!(session.session_id.is_none());
    assert_eq!(session.workspace, Some("/src/tron".into()));
    client.close().await;
}

#[tokio::test]
async fn exhausted_reconnection_ends_disconnected() {
    let mut config = config();
    config.reconnect.max_attempts = 2;
    let (client, dialer, _listener, peer) = connected(config).await;

    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
    client.callbacks().on_connection_lost(move |reason| {
        let _ = lost_tx.send(reason);
    });

    dialer.refuse_all(true);
    drop(peer);

    wait_for_state(&client, ConnectionState::Disconnected).await;
    let reason = tokio::time::timeout(Duration::from_secs(5), lost_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!reason.is_empty());
    assert_eq!(client.reconnect_attempts(), 2);
    assert_eq!(dialer.dial_count(), 3);
    assert_eq!(client.stats().snapshot().reconnect_attempts, 2);
}

#[tokio::test]
async fn closed_without_reconnect_disables_recovery() {
    let (client, dialer, _listener, mut peer) = connected(config()).await;

    peer.send_closed("daemon shutting down", false).await.unwrap();

    wait_for_state(&client, ConnectionState::Disconnected).await;
    assert!(!client.reconnect_enabled());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn closed_with_reconnect_recovers() {
    let (client, dialer, mut listener, mut peer) = connected(config()).await;

    peer.send_closed("restarting", true).await.unwrap();
    let _peer = tokio::time::timeout(Duration::from_secs(5), listener.accept_ready())
        .await
        .unwrap()
        .unwrap();

    wait_for_state(&client, ConnectionState::Connected).await;
    assert!(client.reconnect_enabled());
    assert_eq!(dialer.dial_count(), 2);
    client.close().await;
}

#[tokio::test]
async fn rejected_reconnect_handshake_stops_retrying() {
    let (client, dialer, mut listener, peer) = connected(config()).await;

    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
    client.callbacks().on_connection_lost(move |reason| {
        let _ = lost_tx.send(reason);
    });

    drop(peer);
    let mut next = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    next.reject_handshake("token revoked").await.unwrap();

    wait_for_state(&client, ConnectionState::Disconnected).await;
    let reason = tokio::time::timeout(Duration::from_secs(5), lost_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reason.contains("token revoked"), "got {reason}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dialer.dial_count(), 2);
    assert_eq!(client.reconnect_attempts(), 1);
}

#[tokio::test]
async fn undecodable_closed_notice_still_recovers() {
    let (client, dialer, mut listener, mut peer) = connected(config()).await;

    peer.send_raw(r#"{"type":"closed","data":"going away"}"#)
        .await
        .unwrap();
    let _peer = tokio::time::timeout(Duration::from_secs(5), listener.accept_ready())
        .await
        .unwrap()
        .unwrap();

    wait_for_state(&client, ConnectionState::Connected).await;
    assert!(client.reconnect_enabled());
    assert_eq!(dialer.dial_count(), 2);
    assert_eq!(client.stats().snapshot().frames_dropped, 1);
    client.close().await;
}

#[tokio::test]
async fn transport_failure_fails_in_flight_requests() {
    let mut config = config();
    config.request_timeout = Duration::from_secs(30);
    config.reconnect.base_delay = Duration::from_secs(5);
    config.reconnect.max_delay = Duration::from_secs(5);
    let (client, dialer, _listener, mut peer) = connected(config).await;
    dialer.refuse_all(true);

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_request(Frame::new(FrameKind::SessionList, json!({})))
                .await
        })
    };
    recv(&mut peer).await;
    drop(peer);

    let res = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("request was not failed promptly")
        .unwrap();
    assert!(matches!(res, Err(ClientError::Transport(_))), "got {res:?}");
    wait_for_state(&client, ConnectionState::Reconnecting).await;
    assert_eq!(client.pending_requests(), 0);
    client.close().await;
}

#[tokio::test]
async fn link_lost_right_after_handshake_is_never_left_connected() {
    for _ in 0..50 {
        let mut config = config();
        config.reconnect.enabled = false;
        let (dialer, mut listener) = MockDialer::new();
        let client = DaemonClient::with_dialer(config, Arc::new(dialer.clone()));

        let server = async {
            let mut peer = listener.accept().await.unwrap();
            peer.accept_handshake().await.unwrap();
            drop(peer);
        };
        let (res, ()) = tokio::join!(client.connect(), server);
        if let Err(e) = res {
            assert!(matches!(e, ClientError::Transport(_)), "got {e:?}");
        }

        wait_for_state(&client, ConnectionState::Disconnected).await;
        let err = client
            .send_request(Frame::new(FrameKind::SessionList, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert_eq!(dialer.dial_count(), 1);
        client.close().await;
    }
}

#[tokio::test]
async fn authorization_without_handler_is_denied() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;

    peer.send(&Frame::new(
        FrameKind::AuthorizationRequest,
        json!({"authorization_id": "authz_1", "description": "delete build dir"}),
    ))
    .await
    .unwrap();

    let ack = recv(&mut peer).await;
    assert_eq!(ack.kind, FrameKind::AuthorizationAck);
    assert_eq!(ack.request_id.as_ref().map(|id| id.as_str()), Some("authz_1"));
    assert_eq!(ack.data["authorization_id"], "authz_1");

    let response = recv(&mut peer).await;
    assert_eq!(response.kind, FrameKind::AuthorizationResponse);
    assert_eq!(
        response.request_id.as_ref().map(|id| id.as_str()),
        Some("authz_1")
    );
    let decision: AuthorizationResponse = response.payload().unwrap();
    assert!(!decision.approved);

    // Exactly one ack and one response.
    let ping = {
        let client = client.clone();
        tokio::spawn(async move { client.ping().await })
    };
    let next = recv(&mut peer).await;
    assert_eq!(next.kind, FrameKind::Ping);
    peer.reply(&next, json!(null)).await.unwrap();
    ping.await.unwrap().unwrap();
    client.close().await;
}

struct Approve;

#[async_trait]
impl AuthorizationHandler for Approve {
    async fn authorize(
        &self,
        request: AuthorizationRequest,
    ) -> Result<AuthorizationDecision, ClientError> {
        assert_eq!(request.tool_name.as_deref(), Some("bash"));
        Ok(AuthorizationDecision::approve())
    }
}

struct Refuse;

#[async_trait]
impl AuthorizationHandler for Refuse {
    async fn authorize(
        &self,
        _request: AuthorizationRequest,
    ) -> Result<AuthorizationDecision, ClientError> {
        Err(ClientError::Handler("prompt closed".into()))
    }
}

#[tokio::test]
async fn authorization_handler_decides() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;
    client
        .callbacks()
        .set_authorization_handler(Arc::new(Approve));

    peer.send(&Frame::new(
        FrameKind::AuthorizationRequest,
        json!({"authorization_id": "authz_2", "tool_name": "bash", "description": "ls"}),
    ))
    .await
    .unwrap();

    assert_eq!(recv(&mut peer).await.kind, FrameKind::AuthorizationAck);
    let response: AuthorizationResponse = recv(&mut peer).await.payload().unwrap();
    assert!(response.approved);
    assert_eq!(response.authorization_id.as_str(), "authz_2");
    client.close().await;
}

#[tokio::test]
async fn failing_authorization_handler_denies() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;
    client
        .callbacks()
        .set_authorization_handler(Arc::new(Refuse));

    peer.send(&Frame::new(
        FrameKind::AuthorizationRequest,
        json!({"authorization_id": "authz_3"}),
    ))
    .await
    .unwrap();

    assert_eq!(recv(&mut peer).await.kind, FrameKind::AuthorizationAck);
    let response: AuthorizationResponse = recv(&mut peer).await.payload().unwrap();
    assert!(!response.approved);
    assert!(response.reason.is_some());
    client.close().await;
}

struct PickFirst;

#[async_trait]
impl QuestionHandler for PickFirst {
    async fn answer(&self, request: QuestionRequest) -> Result<QuestionAnswer, ClientError> {
        if request.multi {
            let answers: BTreeMap<String, String> = request
                .questions
                .iter()
                .map(|q| (q.id.clone(), q.options[0].label.clone()))
                .collect();
            Ok(QuestionAnswer::Multi(answers))
        } else if request.prompt == "fail" {
            Err(ClientError::Handler("no terminal".into()))
        } else {
            Ok(QuestionAnswer::Single(request.options[0].label.clone()))
        }
    }
}

#[tokio::test]
async fn questions_are_answered_in_their_mode() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;
    client.callbacks().set_question_handler(Arc::new(PickFirst));

    peer.send(&Frame::new(
        FrameKind::QuestionRequest,
        json!({
            "question_id": "q_multi",
            "multi": true,
            "questions": [
                {"id": "lang", "options": [{"label": "rust"}, {"label": "go"}]},
                {"id": "db", "options": [{"label": "sqlite"}]}
            ]
        }),
    ))
    .await
    .unwrap();
    let response = recv(&mut peer).await;
    assert_eq!(response.kind, FrameKind::QuestionResponse);
    assert_eq!(response.request_id.as_ref().map(|id| id.as_str()), Some("q_multi"));
    let answer: QuestionResponse = response.payload().unwrap();
    let answers = answer.answers.unwrap();
    assert_eq!(answers["lang"], "rust");
    assert_eq!(answers["db"], "sqlite");
    assert!(answer.answer.is_none());

    peer.send(&Frame::new(
        FrameKind::QuestionRequest,
        json!({"question_id": "q_single", "prompt": "fail", "options": [{"label": "yes"}]}),
    ))
    .await
    .unwrap();
    let answer: QuestionResponse = recv(&mut peer).await.payload().unwrap();
    assert_eq!(answer.question_id.as_str(), "q_single");
    assert_eq!(answer.answer.as_deref(), Some(""));
    client.close().await;
}

#[tokio::test]
async fn duplicate_question_ids_are_answered_independently() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;

    let question = Frame::new(
        FrameKind::QuestionRequest,
        json!({"question_id": "q_dup", "prompt": "continue?"}),
    );
    peer.send(&question).await.unwrap();
    peer.send(&question).await.unwrap();

    for _ in 0..2 {
        let answer: QuestionResponse = recv(&mut peer).await.payload().unwrap();
        assert_eq!(answer.question_id.as_str(), "q_dup");
        assert_eq!(answer.answer.as_deref(), Some(""));
    }
    client.close().await;
}

#[tokio::test]
async fn streamed_chat_builds_transcript() {
    let (client, _dialer, _listener, mut peer) = connected(config()).await;

    let transcript = Arc::new(Mutex::new(Transcript::new()));
    let sink = transcript.clone();
    client
        .callbacks()
        .on_chat_message(move |message| {
            sink.lock().apply(&message);
        });
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    client.callbacks().on_chat_complete(move |complete| {
        let _ = done_tx.send(complete);
    });

    let send = client.chat_send(SessionId::from_raw("sess_chat"), "hi");
    let server = async {
        let request = recv(&mut peer).await;
        assert_eq!(request.kind, FrameKind::ChatSend);
        assert_eq!(request.data["content"], "hi");
        peer.reply(&request, json!({"turn_id": "turn_1"})).await.unwrap();
    };
    let (accepted, ()) = tokio::join!(send, server);
    assert_eq!(accepted.unwrap().turn_id.as_deref(), Some("turn_1"));

    for (content, is_final) in [("Hel", false), ("lo", false), ("Hello", true), ("Hello", true)] {
        peer.send(&Frame::new(
            FrameKind::ChatMessage,
            json!({"session_id": "sess_chat", "message_id": "m1", "content": content, "final": is_final}),
        ))
        .await
        .unwrap();
    }
    peer.send(&Frame::new(
        FrameKind::ChatComplete,
        json!({"session_id": "sess_chat", "stop_reason": "end_turn"}),
    ))
    .await
    .unwrap();

    let complete = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(complete.stop_reason.as_deref(), Some("end_turn"));
    assert_eq!(transcript.lock().text(), "Hello");
    client.close().await;
}

#[tokio::test]
async fn heartbeat_sends_uncorrelated_pings() {
    let mut config = config();
    config.heartbeat_interval = Duration::from_millis(20);
    let (client, _dialer, _listener, mut peer) = connected(config).await;

    let ping = tokio::time::timeout(Duration::from_secs(5), peer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ping.kind, FrameKind::Ping);
    assert!(ping.request_id.is_none());

    peer.send(&Frame::new(FrameKind::Pong, json!(null)))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.stats().snapshot().pongs == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    client.close().await;
}

#[tokio::test]
async fn state_changes_reach_observers() {
    let (dialer, mut listener) = MockDialer::new();
    let client = DaemonClient::with_dialer(config(), Arc::new(dialer));
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    client
        .callbacks()
        .on_state_change(move |change| sink.lock().push(change.to));

    let (res, _peer) = tokio::join!(client.connect(), listener.accept_ready());
    res.unwrap();

    // Lifecycle callbacks run on their own lane; wait for it to catch up.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !changes.lock().contains(&ConnectionState::Connected) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    client.close().await;

    let seen = changes.lock().clone();
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Closed
        ]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn connects_over_unix_socket() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let hello = Frame::decode(&line).unwrap();
        assert_eq!(hello.kind, FrameKind::AuthRequest);
        let reply = Frame::response(
            hello.request_id.unwrap(),
            FrameKind::AuthResponse,
            json!({"success": true}),
        );
        write
            .write_all(format!("{}\n", reply.encode().unwrap()).as_bytes())
            .await
            .unwrap();
        // Hold the connection until the client goes away.
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let mut config = config();
    config.address = Address::Unix(path);
    let client = DaemonClient::new(config);
    client.connect().await.unwrap();
    assert!(client.is_connected());
    client.close().await;
    server.await.unwrap();
}
