use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use storyloom_client::api::{
    ApiError, LoadedSession, ReviewDecision, ReviewResponse, SendMessageRequest,
    SendMessageResponse, SessionApi,
};
use storyloom_client::session::{SessionLimits, SessionMachine, StreamStatus};
use storyloom_client::transport::{ScriptStep, ScriptedStream, ScriptedTransport, TransportError};
use storyloom_client::SendOptions;
use storyloom_proto::{Envelope, MessageStatus, Role, Session, SessionStatus};
use surface_bus::{LocalBus, SurfaceId, SyncChannel, SyncMessage};
use tokio::sync::Notify;
use tokio::time::timeout;

#[derive(Default)]
struct FakeApi {
    sends: Mutex<Vec<(Option<String>, SendMessageRequest)>>,
    loaded: Mutex<Option<LoadedSession>>,
    fail_load: Mutex<bool>,
    gate: Option<Arc<Notify>>,
}

impl FakeApi {
    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn load_session(&self, session_id: &str) -> Result<LoadedSession, ApiError> {
        if *self.fail_load.lock() {
            return Err(ApiError::UnexpectedStatus {
                status: reqwest::StatusCode::NOT_FOUND,
                body: format!("no session {session_id}"),
            });
        }
        let loaded = self.loaded.lock().clone();
        Ok(loaded.unwrap_or_else(|| LoadedSession {
            session: Session::new(session_id),
            messages: Vec::new(),
            artifacts: Vec::new(),
            active_run_id: None,
        }))
    }

    async fn send_message(
        &self,
        session_id: Option<&str>,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ApiError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let mut sends = self.sends.lock();
        sends.push((session_id.map(str::to_string), request.clone()));
        Ok(SendMessageResponse {
            session_id: "sess-1".into(),
            run_id: format!("run-{}", sends.len()),
        })
    }

    async fn review(
        &self,
        _session_id: &str,
        decision: ReviewDecision,
        note: Option<&str>,
    ) -> Result<ReviewResponse, ApiError> {
        let status = match decision {
            ReviewDecision::Approve => "approved",
            ReviewDecision::Reject => "rejected",
        };
        Ok(serde_json::from_value(json!({
            "status": status,
            "metadata": {"review_note": note},
        }))
        .expect("review response"))
    }
}

fn machine(api: Arc<FakeApi>, transport: Arc<ScriptedTransport>) -> SessionMachine {
    SessionMachine::new(
        api,
        transport,
        SessionLimits::default(),
        HashSet::from(["create_scene".to_string(), "scene".to_string()]),
    )
}

fn event(kind: &str, event_id: u64, payload: Value) -> Envelope {
    Envelope::from_value(&json!({
        "type": kind,
        "session_id": "sess-1",
        "run_id": "run-1",
        "event_id": event_id,
        "payload": payload,
    }))
    .expect("valid envelope")
}

fn stream(transport: &ScriptedTransport) -> ScriptedStream {
    transport.last_stream().expect("a stream was opened")
}

#[tokio::test]
async fn chat_reply_streams_into_one_assistant_message() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(FakeApi::gated(gate.clone()));
    let transport = Arc::new(ScriptedTransport::manual());
    let machine = Arc::new(machine(api.clone(), transport.clone()));

    let send = {
        let machine = machine.clone();
        tokio::spawn(async move { machine.send_message("hi", SendOptions::default()).await })
    };
    timeout(Duration::from_secs(1), async {
        while machine.snapshot().messages.is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("optimistic message appears before the send completes");
    let optimistic = machine.snapshot().messages;
    assert_eq!(optimistic[0].role, Role::User);
    assert_eq!(optimistic[0].content, "hi");
    assert_eq!(transport.opened(), 0);

    gate.notify_one();
    let run_id = timeout(Duration::from_secs(1), send)
        .await
        .expect("send finished")
        .expect("send task")
        .expect("send succeeded");
    assert_eq!(run_id, "run-1");
    assert!(machine.is_streaming());

    let stream = stream(&transport);
    assert_eq!(stream.run_id(), "run-1");
    stream.open();
    stream.emit(event("thinking", 1, json!({"message_id": "m1"})));
    stream.emit(event("delta", 2, json!({"message_id": "m1", "delta": "Hel"})));
    stream.emit(event("delta", 3, json!({"message_id": "m1", "delta": "lo"})));
    stream.emit(event("delta", 3, json!({"message_id": "m1", "delta": "lo"})));
    stream.emit(event("message", 4, json!({"message_id": "m1", "content": "Hello"})));

    let view = machine.snapshot();
    let summary: Vec<_> = view
        .messages
        .iter()
        .map(|message| (message.role, message.content.as_str(), message.status))
        .collect();
    assert_eq!(
        summary,
        [
            (Role::User, "hi", MessageStatus::Complete),
            (Role::Assistant, "Hello", MessageStatus::Complete),
        ]
    );
    assert_eq!(view.session.map(|session| session.id), Some("sess-1".into()));

    let sends = api.sends.lock();
    assert_eq!(sends[0].0, None);
    assert!(sends[0].1.client_message_id.starts_with("local-"));
}

#[tokio::test]
async fn tool_result_and_artifact_update_describe_one_scene() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(ScriptedTransport::manual());
    let machine = machine(api, transport.clone());
    let mut notices = machine.subscribe_tool_results();

    machine
        .send_message("make a scene", SendOptions::default())
        .await
        .expect("send");
    let stream = stream(&transport);
    let result = event(
        "tool_result",
        1,
        json!({"name": "create_scene", "output": {"scene_id": "s1", "title": "Opening"}}),
    );
    stream.emit(result.clone());
    stream.emit(result);
    stream.emit(event(
        "artifact_update",
        2,
        json!({"scene_id": "s1", "duration": 12}),
    ));

    let scenes = machine.snapshot().scenes;
    assert_eq!(scenes.len(), 1);
    assert_eq!(scenes[0].id, "s1");
    assert_eq!(scenes[0].title(), Some("Opening"));
    assert_eq!(scenes[0].duration(), Some(12.0));

    let notice = notices.try_recv().expect("one tool result notice");
    assert_eq!(notice.name, "create_scene");
    assert_eq!(notice.session_id.as_deref(), Some("sess-1"));
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn transport_error_keeps_progress_already_shown() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(ScriptedTransport::manual());
    let machine = machine(api, transport.clone());
    machine
        .send_message("render", SendOptions::default())
        .await
        .expect("send");

    let stream = stream(&transport);
    stream.emit(event("job_progress", 1, json!({"job_id": "j1", "progress": 20})));
    stream.emit(event("job_progress", 2, json!({"job_id": "j2", "progress": 40})));
    stream.fail(TransportError::Socket("connection reset".into()));

    let view = machine.snapshot();
    assert!(!view.is_streaming);
    assert_eq!(view.stream_status, StreamStatus::Error);
    assert!(view
        .error
        .as_deref()
        .is_some_and(|error| error.contains("connection reset")));
    let jobs: Vec<_> = view
        .messages
        .iter()
        .filter(|message| message.role == Role::Tool)
        .map(|message| message.id.as_str())
        .collect();
    assert_eq!(jobs, ["job:j1", "job:j2"]);
}

#[tokio::test]
async fn scripted_run_fails_after_progress() {
    let transport = Arc::new(ScriptedTransport::with_script(vec![
        ScriptStep::Open,
        ScriptStep::Event(event("job_started", 1, json!({"job_id": "j1", "name": "render_video"}))),
        ScriptStep::Sleep(Duration::from_millis(5)),
        ScriptStep::Event(event("job_progress", 2, json!({"job_id": "j1", "progress": 60}))),
        ScriptStep::Error(TransportError::Read("body ended early".into())),
        ScriptStep::Close,
    ]));
    let machine = machine(Arc::new(FakeApi::default()), transport);
    let mut revisions = machine.watch_revision();
    machine
        .send_message("render it", SendOptions::default())
        .await
        .expect("send");

    timeout(Duration::from_secs(5), async {
        while machine.snapshot().stream_status == StreamStatus::Streaming {
            revisions.changed().await.expect("machine alive");
        }
    })
    .await
    .expect("script finished");

    let view = machine.snapshot();
    assert_eq!(view.stream_status, StreamStatus::Error);
    assert!(view
        .error
        .as_deref()
        .is_some_and(|error| error.contains("body ended early")));
    let job = view
        .messages
        .iter()
        .find(|message| message.id == "job:j1")
        .expect("job message kept");
    assert_eq!(job.status, MessageStatus::Running);
    assert_eq!(job.output.get("progress"), Some(&json!(60.0)));
}

#[tokio::test]
async fn stop_mid_stream_keeps_partial_reply() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(ScriptedTransport::manual());
    let machine = machine(api, transport.clone());
    machine
        .send_message("tell me a story", SendOptions::default())
        .await
        .expect("send");

    let stream = stream(&transport);
    stream.emit(event("delta", 1, json!({"message_id": "m1", "delta": "Once upon"})));
    machine.stop();
    machine.stop();
    stream.emit(event("delta", 2, json!({"message_id": "m1", "delta": " a time"})));
    stream.fail(TransportError::Socket("closed by peer".into()));

    let view = machine.snapshot();
    assert!(!view.is_streaming);
    assert_eq!(view.stream_status, StreamStatus::Cancelled);
    assert!(view.error.is_none());
    assert!(stream.control().is_closed());
    let reply = view
        .messages
        .iter()
        .find(|message| message.id == "m1")
        .expect("partial reply kept");
    assert_eq!(reply.content, "Once upon");
    assert_eq!(reply.status, MessageStatus::Streaming);
}

#[tokio::test]
async fn second_send_replaces_the_first_stream() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(ScriptedTransport::manual());
    let machine = machine(api.clone(), transport.clone());

    machine.send_message("one", SendOptions::default()).await.expect("first send");
    machine.send_message("two", SendOptions::default()).await.expect("second send");
    assert_eq!(transport.opened(), 2);

    let first = transport.stream(0).expect("first stream");
    let second = transport.stream(1).expect("second stream");
    assert!(first.control().is_closed());
    assert!(!second.control().is_closed());

    first.emit(event("delta", 1, json!({"message_id": "stale", "delta": "late"})));
    first.finish();
    assert!(machine.snapshot().messages.iter().all(|message| message.id != "stale"));
    assert!(machine.is_streaming());

    second.finish();
    assert_eq!(machine.snapshot().stream_status, StreamStatus::Complete);
    assert_eq!(api.sends.lock()[1].0.as_deref(), Some("sess-1"));
}

#[tokio::test]
async fn cancel_without_socket_uses_rest_fallback() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(ScriptedTransport::manual());
    let machine = machine(api, transport.clone());

    machine.cancel_run().await.expect("cancel while idle");
    assert!(transport.cancelled_runs().is_empty());

    machine.send_message("go", SendOptions::default()).await.expect("send");
    machine.cancel_run().await.expect("cancel");
    assert_eq!(transport.cancelled_runs(), ["run-1"]);
    assert!(!machine.is_streaming());
    let view = machine.snapshot();
    assert_eq!(view.stream_status, StreamStatus::Cancelled);
    assert!(view.error.is_none());
}

#[tokio::test]
async fn load_resumes_active_run_and_failed_load_keeps_state() {
    let api = Arc::new(FakeApi::default());
    *api.loaded.lock() = Some(
        serde_json::from_value(json!({
            "session": {"id": "sess-9", "status": "pending_review", "title": "Trailer"},
            "messages": [{"id": "u1", "role": "user", "content": "hi"}],
            "artifacts": [{"id": "a1", "type": "scene", "payload": {"scene_id": "s1", "title": "Cold open"}}],
            "active_run_id": "run-9",
        }))
        .expect("loaded session"),
    );
    let transport = Arc::new(ScriptedTransport::manual());
    let machine = machine(api.clone(), transport.clone());

    machine.load_session("sess-9").await.expect("load");
    let view = machine.snapshot();
    assert_eq!(view.session.as_ref().map(|s| s.status.clone()), Some(SessionStatus::PendingReview));
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.scenes[0].title(), Some("Cold open"));
    assert!(view.is_streaming);
    assert_eq!(stream(&transport).run_id(), "run-9");

    *api.fail_load.lock() = true;
    let err = machine.load_session("missing").await.expect_err("load fails");
    assert!(err.to_string().contains("404"));
    let view = machine.snapshot();
    assert_eq!(view.session.map(|s| s.id), Some("sess-9".into()));
    assert_eq!(view.messages.len(), 1);
    assert!(view.error.is_some());
}

#[tokio::test]
async fn review_updates_status_and_metadata() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(ScriptedTransport::manual());
    let machine = machine(api, transport);
    machine.load_session("sess-1").await.expect("load");

    let response = machine
        .approve_session("sess-1", Some("looks good"))
        .await
        .expect("approve");
    assert_eq!(response.status, SessionStatus::Approved);
    let session = machine.snapshot().session.expect("session");
    assert_eq!(session.status, SessionStatus::Approved);
    assert_eq!(session.metadata.get("review_note"), Some(&json!("looks good")));

    machine.reject_session("sess-1", None).await.expect("reject");
    assert_eq!(
        machine.snapshot().session.map(|s| s.status),
        Some(SessionStatus::Rejected)
    );
}

#[tokio::test]
async fn scenes_are_published_to_the_canvas() {
    let api = Arc::new(FakeApi::default());
    let transport = Arc::new(ScriptedTransport::manual());
    let machine = machine(api, transport.clone());
    machine.send_message("scenes", SendOptions::default()).await.expect("send");
    let stream = stream(&transport);
    stream.emit(event("artifact_update", 1, json!({"scene_id": "s2", "title": "Chase"})));
    stream.emit(event("artifact_update", 2, json!({"scene_id": "s1", "title": "Intro"})));

    let bus = Arc::new(LocalBus::new());
    let studio = SyncChannel::new(bus.clone(), SurfaceId::new("studio"));
    let canvas = SyncChannel::new(bus, SurfaceId::new("canvas"));
    let mut canvas_rx = canvas.subscribe(None);

    assert_eq!(machine.publish_scenes(&studio).expect("publish"), 1);
    let (source, message) = timeout(Duration::from_secs(1), canvas_rx.recv())
        .await
        .expect("snapshot delivered")
        .expect("decoded snapshot");
    assert_eq!(source.as_str(), "studio");
    let snapshot = match message {
        SyncMessage::GraphSnapshot(snapshot) => snapshot,
        _ => panic!("expected a graph snapshot"),
    };
    let ids: Vec<_> = snapshot.nodes().iter().map(|node| node.id.as_str()).collect();
    assert_eq!(ids, ["s1", "s2"]);
    assert_eq!(snapshot.edges().len(), 1);
    assert_eq!(snapshot.edges()[0].source, "s2");
}
