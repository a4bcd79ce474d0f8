use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{ClientRequest, ProgressEvent, ServerEvent, WorkerMessage, WorkflowRequest};
use crate::reducer::LessonState;
use crate::server::AppState;
use crate::workers::supervisor::{
    ExitReason, WorkerEvent, WorkerExit, WorkerHandle, WorkflowLauncher,
};

/// Connection lifecycle. A connection carries at most one workflow;
/// once a terminal event has been emitted the connection is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AwaitingWorker,
    Streaming,
    Closed,
}

/// Per-connection workflow state machine, kept free of socket I/O so
/// its transitions can be exercised directly. The surrounding socket
/// loop owns the transport and the worker handle; the session decides
/// what to emit.
pub struct WorkflowSession {
    launcher: Arc<dyn WorkflowLauncher>,
    phase: SessionPhase,
    state: Option<LessonState>,
}

impl WorkflowSession {
    pub fn new(launcher: Arc<dyn WorkflowLauncher>) -> Self {
        Self {
            launcher,
            phase: SessionPhase::Idle,
            state: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    fn has_active_workflow(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::AwaitingWorker | SessionPhase::Streaming
        )
    }

    /// Handle one inbound text frame. Returns the events to send and,
    /// when a workflow was started, the worker handle for the caller
    /// to poll.
    pub async fn handle_client_text(
        &mut self,
        text: &str,
    ) -> (Vec<ServerEvent>, Option<WorkerHandle>) {
        let request: ClientRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Rejecting malformed client frame");
                return (
                    vec![ServerEvent::error(format!("malformed request: {e}"))],
                    None,
                );
            }
        };
        let ClientRequest::GenerateLesson { data } = request;
        self.start_workflow(data).await
    }

    async fn start_workflow(
        &mut self,
        request: WorkflowRequest,
    ) -> (Vec<ServerEvent>, Option<WorkerHandle>) {
        if self.has_active_workflow() {
            warn!("Rejecting generate_lesson while a workflow is active on this connection");
            return (
                vec![ServerEvent::error(
                    "a workflow is already running on this connection",
                )],
                None,
            );
        }
        if self.phase == SessionPhase::Closed {
            return (Vec::new(), None);
        }
        if let Err(e) = request.validate() {
            return (
                vec![ServerEvent::error(format!("invalid request: {e}"))],
                None,
            );
        }

        match self.launcher.launch(&request).await {
            Ok(handle) => {
                info!(
                    worker_id = %handle.worker_id,
                    topic = %request.topic,
                    "Workflow started"
                );
                self.state = Some(LessonState::new(&request));
                self.phase = SessionPhase::AwaitingWorker;
                (Vec::new(), Some(handle))
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn workflow worker");
                self.phase = SessionPhase::Closed;
                (
                    vec![ServerEvent::error(format!("failed to start workflow: {e}"))],
                    None,
                )
            }
        }
    }

    /// Fold one worker event. Messages are forwarded in arrival order,
    /// without reordering or batching; anything after the terminal
    /// event is ignored.
    pub fn handle_worker_event(&mut self, event: WorkerEvent) -> Vec<ServerEvent> {
        if self.phase == SessionPhase::Closed {
            return Vec::new();
        }
        match event {
            WorkerEvent::Message(message) => self.handle_worker_message(message),
            WorkerEvent::Exited(exit) => self.handle_worker_exit(exit),
        }
    }

    fn handle_worker_message(&mut self, message: WorkerMessage) -> Vec<ServerEvent> {
        if self.phase == SessionPhase::AwaitingWorker {
            self.phase = SessionPhase::Streaming;
        }
        if let Some(state) = self.state.as_mut() {
            state.apply(&message);
        }

        match message {
            WorkerMessage::Progress {
                stage,
                progress,
                message,
                data,
            } => vec![ServerEvent::Progress {
                data: ProgressEvent {
                    stage,
                    progress,
                    message,
                    data,
                },
            }],
            WorkerMessage::ContentChunk { data } => vec![ServerEvent::ContentChunk { data }],
            WorkerMessage::Complete { .. } => {
                self.phase = SessionPhase::Closed;
                match self.state.take() {
                    Some(state) => vec![ServerEvent::Complete {
                        data: Box::new(state),
                    }],
                    None => vec![ServerEvent::error(
                        "workflow completed without accumulated state",
                    )],
                }
            }
            // informational: a partial failure does not end the stream
            WorkerMessage::Error { message } => vec![ServerEvent::error(message)],
        }
    }

    fn handle_worker_exit(&mut self, exit: WorkerExit) -> Vec<ServerEvent> {
        self.phase = SessionPhase::Closed;
        let message = match exit.reason {
            // clean exit without a terminal protocol message is an
            // anomaly; the worker contract requires one
            ExitReason::Clean => "worker exited without a completion message".to_string(),
            ExitReason::Failed { code } => {
                let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                if exit.stderr_tail.is_empty() {
                    format!("workflow failed (exit code {code})")
                } else {
                    format!("workflow failed (exit code {code}): {}", exit.stderr_tail)
                }
            }
            ExitReason::TimedOut => "workflow timed out".to_string(),
            ExitReason::OutputOverflow => "worker produced oversized output".to_string(),
        };
        warn!(message = %message, "Workflow ended in error");
        vec![ServerEvent::error(message)]
    }
}

/// WebSocket handler for the streaming lesson workflow.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    info!("WebSocket connection request received at /ws endpoint");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    info!(connection_id = %connection_id, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.outbound_queue_depth);

    // outgoing pump; keeps draining queued frames after the relay
    // loop ends so terminal events reach the client
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let launcher: Arc<dyn WorkflowLauncher> = state.supervisor.clone();
    let mut session = WorkflowSession::new(launcher);
    let mut handle: Option<WorkerHandle> = None;

    loop {
        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let (events, started) = session.handle_client_text(&text).await;
                        if let Some(started) = started {
                            handle = Some(started);
                        }
                        if !queue_events(&tx, connection_id, events) {
                            break;
                        }
                        if session.phase() == SessionPhase::Closed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(data))) => {
                        warn!(
                            connection_id = %connection_id,
                            bytes = data.len(),
                            "Ignoring unexpected binary frame"
                        );
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(connection_id = %connection_id, ?frame, "Client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                }
            }
            event = async {
                match handle.as_mut() {
                    Some(h) => h.next_event().await,
                    None => std::future::pending().await,
                }
            }, if handle.is_some() => {
                let events = match event {
                    Some(event) => session.handle_worker_event(event),
                    // stream ended without an exit report
                    None => session.handle_worker_event(WorkerEvent::Exited(WorkerExit {
                        reason: ExitReason::Failed { code: None },
                        stderr_tail: String::new(),
                    })),
                };
                if !queue_events(&tx, connection_id, events) {
                    break;
                }
                if session.phase() == SessionPhase::Closed {
                    break;
                }
            }
        }
    }

    // a running worker must not outlive its connection
    if let Some(mut h) = handle.take() {
        h.terminate();
    }
    info!(connection_id = %connection_id, "WebSocket connection closed");
}

/// Queue outbound events without blocking the relay loop. Returns
/// false when the connection should be dropped: the peer is gone or
/// cannot drain the bounded queue.
fn queue_events(tx: &mpsc::Sender<Message>, connection_id: Uuid, events: Vec<ServerEvent>) -> bool {
    for event in events {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                error!(
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to serialize outbound event"
                );
                continue;
            }
        };
        match tx.try_send(Message::Text(text)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %connection_id,
                    "Outbound queue full, dropping connection"
                );
                return false;
            }
            Err(TrySendError::Closed(_)) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContentChunk, WorkflowStage};
    use crate::workers::supervisor::SpawnError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    struct FakeWorker {
        #[allow(dead_code)]
        events: mpsc::Sender<WorkerEvent>,
        terminated: oneshot::Receiver<()>,
    }

    /// Launcher double that records launches and exposes the channels
    /// behind the last handed-out handle.
    #[derive(Default)]
    struct FakeLauncher {
        launches: AtomicUsize,
        last: Mutex<Option<FakeWorker>>,
    }

    impl FakeLauncher {
        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        fn take_last(&self) -> FakeWorker {
            self.last.lock().unwrap().take().unwrap()
        }
    }

    #[async_trait]
    impl WorkflowLauncher for FakeLauncher {
        async fn launch(&self, _request: &WorkflowRequest) -> Result<WorkerHandle, SpawnError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let (events_tx, events_rx) = mpsc::channel(16);
            let (term_tx, term_rx) = oneshot::channel();
            *self.last.lock().unwrap() = Some(FakeWorker {
                events: events_tx,
                terminated: term_rx,
            });
            Ok(WorkerHandle::new(Uuid::new_v4(), events_rx, term_tx))
        }
    }

    struct FailingLauncher;

    #[async_trait]
    impl WorkflowLauncher for FailingLauncher {
        async fn launch(&self, _request: &WorkflowRequest) -> Result<WorkerHandle, SpawnError> {
            Err(SpawnError::Io(std::io::Error::other(
                "no such script",
            )))
        }
    }

    const START: &str = r#"{"type":"generate_lesson","data":{"topic":"Photosynthesis","age_group":"high school","knowledge_level":"beginner"}}"#;

    fn progress_message() -> WorkerEvent {
        WorkerEvent::Message(WorkerMessage::Progress {
            stage: WorkflowStage::LessonPlanning,
            progress: 15.0,
            message: "planning".to_string(),
            data: None,
        })
    }

    fn assert_single_error(events: &[ServerEvent]) -> String {
        match events {
            [ServerEvent::Error { data }] => data.message.clone(),
            other => panic!("expected a single error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_spawns_one_worker_and_transitions() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut session = WorkflowSession::new(launcher.clone());

        let (events, handle) = session.handle_client_text(START).await;
        assert!(events.is_empty());
        assert!(handle.is_some());
        assert_eq!(session.phase(), SessionPhase::AwaitingWorker);
        assert_eq!(launcher.launches(), 1);

        let events = session.handle_worker_event(progress_message());
        assert!(matches!(&events[..], [ServerEvent::Progress { .. }]));
        assert_eq!(session.phase(), SessionPhase::Streaming);
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_spawning() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut session = WorkflowSession::new(launcher.clone());

        let (_, handle) = session.handle_client_text(START).await;
        assert!(handle.is_some());

        let (events, second) = session.handle_client_text(START).await;
        assert!(second.is_none());
        let message = assert_single_error(&events);
        assert!(message.contains("already running"));
        assert_eq!(launcher.launches(), 1, "no second process may be spawned");
        // the running workflow is undisturbed
        assert_eq!(session.phase(), SessionPhase::AwaitingWorker);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_spawn() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut session = WorkflowSession::new(launcher.clone());

        let empty_topic = r#"{"type":"generate_lesson","data":{"topic":" ","age_group":"college","knowledge_level":"advanced"}}"#;
        let (events, handle) = session.handle_client_text(empty_topic).await;
        assert!(handle.is_none());
        assert_single_error(&events);
        assert_eq!(launcher.launches(), 0);
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn malformed_frame_is_answered_with_error() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut session = WorkflowSession::new(launcher.clone());

        let (events, handle) = session.handle_client_text("not json at all").await;
        assert!(handle.is_none());
        assert_single_error(&events);
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_emits_terminal_error_and_closes() {
        let mut session = WorkflowSession::new(Arc::new(FailingLauncher));

        let (events, handle) = session.handle_client_text(START).await;
        assert!(handle.is_none());
        let message = assert_single_error(&events);
        assert!(message.contains("failed to start workflow"));
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn failed_exit_emits_exactly_one_error_and_no_complete() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut session = WorkflowSession::new(launcher.clone());
        session.handle_client_text(START).await;

        session.handle_worker_event(progress_message());
        let events = session.handle_worker_event(WorkerEvent::Exited(WorkerExit {
            reason: ExitReason::Failed { code: Some(1) },
            stderr_tail: "boom".to_string(),
        }));
        let message = assert_single_error(&events);
        assert!(message.contains("boom"));
        assert_eq!(session.phase(), SessionPhase::Closed);

        // nothing further is emitted, not even a late completion
        let late = session.handle_worker_event(WorkerEvent::Message(WorkerMessage::Complete {
            data: None,
        }));
        assert!(late.is_empty());
    }

    #[tokio::test]
    async fn clean_exit_without_terminal_message_is_an_error() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut session = WorkflowSession::new(launcher.clone());
        session.handle_client_text(START).await;

        let events = session.handle_worker_event(WorkerEvent::Exited(WorkerExit {
            reason: ExitReason::Clean,
            stderr_tail: String::new(),
        }));
        let message = assert_single_error(&events);
        assert!(message.contains("without a completion message"));
    }

    #[tokio::test]
    async fn complete_carries_accumulated_state() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut session = WorkflowSession::new(launcher.clone());
        session.handle_client_text(START).await;

        session.handle_worker_event(progress_message());
        session.handle_worker_event(WorkerEvent::Message(WorkerMessage::ContentChunk {
            data: ContentChunk {
                point_title: "Chlorophyll".to_string(),
                chunk: "Hello ".to_string(),
                complete: false,
            },
        }));
        session.handle_worker_event(WorkerEvent::Message(WorkerMessage::ContentChunk {
            data: ContentChunk {
                point_title: "Chlorophyll".to_string(),
                chunk: "world".to_string(),
                complete: true,
            },
        }));

        let events = session.handle_worker_event(WorkerEvent::Message(WorkerMessage::Complete {
            data: None,
        }));
        match &events[..] {
            [ServerEvent::Complete { data }] => {
                assert_eq!(data.current_processing, WorkflowStage::Complete);
                assert_eq!(data.content_data["Chlorophyll"], "Hello world");
                assert!(data.completed_points.contains("Chlorophyll"));
                assert_eq!(data.topic, "Photosynthesis");
            }
            other => panic!("expected complete event, got {other:?}"),
        }
        assert_eq!(session.phase(), SessionPhase::Closed);

        // a late exit report after the terminal event is ignored
        let late = session.handle_worker_event(WorkerEvent::Exited(WorkerExit {
            reason: ExitReason::Clean,
            stderr_tail: String::new(),
        }));
        assert!(late.is_empty());
    }

    #[tokio::test]
    async fn worker_error_message_does_not_end_the_stream() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut session = WorkflowSession::new(launcher.clone());
        session.handle_client_text(START).await;

        let events = session.handle_worker_event(WorkerEvent::Message(WorkerMessage::Error {
            message: "image search failed".to_string(),
        }));
        assert_single_error(&events);
        assert_eq!(session.phase(), SessionPhase::Streaming);

        let events = session.handle_worker_event(progress_message());
        assert!(matches!(&events[..], [ServerEvent::Progress { .. }]));
    }

    #[tokio::test]
    async fn disconnect_cleanup_terminates_the_worker() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut session = WorkflowSession::new(launcher.clone());

        let (_, handle) = session.handle_client_text(START).await;
        let mut handle = handle.unwrap();
        let worker = launcher.take_last();

        // what handle_socket does when the peer goes away
        handle.terminate();

        worker
            .terminated
            .await
            .expect("termination must be signalled to the worker");
    }
}
