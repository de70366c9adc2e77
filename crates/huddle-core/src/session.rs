use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::alerts::{Alert, AlertSink};
use crate::backend::{CallBackend, CallId, CallMetadata, HttpBackend, JoinGrant};
use crate::config::ClientConfig;
use crate::controls::ControlSurface;
use crate::errors::CallError;
use crate::events::{
    CallEvent, CallEventListener, ConnectionState, EventEmitter, LocalControlState, TrackKind, TransportEvent,
};
use crate::livekit_transport::LiveKitTransport;
use crate::media::{AudioSink, I420Frame, PcmFrame, VideoSink};
use crate::names::{Labels, NameContext};
use crate::permissions::{Platform, request_call_permissions};
use crate::reconciler::{CallState, apply, apply_snapshot};
use crate::render::{Tile, render_tiles};
use crate::transport::{Connection, Transport, TransportControls, websocket_url};

/// The call currently owned by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_id: CallId,
    pub metadata: CallMetadata,
}

/// Join stages already completed for a call, kept so that a retry resumes
/// where the last attempt stopped.
#[derive(Debug, Clone)]
struct JoinProgress {
    call_id: CallId,
    permitted: bool,
    grant: Option<JoinGrant>,
}

#[derive(Default)]
struct Live {
    state: CallState,
    session: Option<CallSession>,
}

/// State reachable from both the controller and the reconciliation task.
struct Shared {
    emitter: EventEmitter,
    labels: Labels,
    current_user_id: Option<String>,
    /// Bumped whenever the current session is abandoned. Every asynchronous
    /// continuation compares its ticket before touching `live`.
    generation: AtomicU64,
    live: Mutex<Live>,
    controls: Mutex<ControlSurface>,
}

impl Shared {
    fn is_current(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket
    }

    fn ensure_current(&self, ticket: u64) -> Result<(), CallError> {
        if self.is_current(ticket) { Ok(()) } else { Err(CallError::Cancelled) }
    }

    /// Apply `f` as one atomic transition, unless the session was abandoned.
    async fn update<F>(&self, ticket: u64, f: F) -> Result<(), CallError>
    where
        F: FnOnce(&mut Live),
    {
        let mut live = self.live.lock().await;
        self.ensure_current(ticket)?;
        f(&mut live);
        Ok(())
    }

    async fn set_connection(&self, ticket: u64, connection: ConnectionState) -> Result<(), CallError> {
        self.update(ticket, |live| {
            live.state = std::mem::take(&mut live.state).with_connection(connection);
        })
        .await?;
        tracing::info!("connection state: {connection:?}");
        self.emitter.emit(CallEvent::ConnectionStateChanged(connection));
        Ok(())
    }

    async fn tiles(&self) -> Vec<Tile> {
        let controls = self.controls.lock().await.state();
        let live = self.live.lock().await;
        let empty = CallMetadata::default();
        let call = live.session.as_ref().map(|s| &s.metadata).unwrap_or(&empty);
        let current_user_id = self
            .current_user_id
            .as_deref()
            .or_else(|| live.state.local().map(|p| p.identity.as_str()));
        let names = NameContext {
            current_user_id,
            call,
            labels: &self.labels,
        };
        render_tiles(&live.state, &names, controls)
    }

    async fn emit_tiles(&self) {
        let tiles = self.tiles().await;
        self.emitter.emit(CallEvent::TilesChanged(tiles));
    }
}

/// Owns one call at a time: runs the join pipeline, folds transport events
/// into [`CallState`], and tears everything down on leave.
pub struct CallController {
    backend: Arc<dyn CallBackend>,
    transport: Arc<dyn Transport>,
    platform: Arc<dyn Platform>,
    alerts: Arc<dyn AlertSink>,
    transport_url: String,
    shared: Arc<Shared>,
    progress: Mutex<Option<JoinProgress>>,
    reconcile_task: StdMutex<Option<JoinHandle<()>>>,
}

impl CallController {
    pub fn new(
        config: &ClientConfig,
        backend: Arc<dyn CallBackend>,
        transport: Arc<dyn Transport>,
        platform: Arc<dyn Platform>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let shared = Shared {
            emitter: EventEmitter::new(),
            labels: config.labels(),
            current_user_id: config.current_user_id.clone(),
            generation: AtomicU64::new(0),
            live: Mutex::new(Live::default()),
            controls: Mutex::new(ControlSurface::new(backend.clone())),
        };
        Self {
            backend,
            transport,
            platform,
            alerts,
            transport_url: config.transport_url.clone(),
            shared: Arc::new(shared),
            progress: Mutex::new(None),
            reconcile_task: StdMutex::new(None),
        }
    }

    /// Controller wired to the HTTP backend and the LiveKit transport.
    pub fn with_defaults(
        config: &ClientConfig,
        platform: Arc<dyn Platform>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self, CallError> {
        let backend = HttpBackend::new(&config.api_base_url, config.api_token.clone())?;
        Ok(Self::new(
            config,
            Arc::new(backend),
            Arc::new(LiveKitTransport::new()),
            platform,
            alerts,
        ))
    }

    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.shared.emitter.add_listener(listener);
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.live.lock().await.state.connection()
    }

    pub async fn call_state(&self) -> CallState {
        self.shared.live.lock().await.state.clone()
    }

    pub async fn session(&self) -> Option<CallSession> {
        self.shared.live.lock().await.session.clone()
    }

    pub async fn local_controls(&self) -> LocalControlState {
        self.shared.controls.lock().await.state()
    }

    pub async fn tiles(&self) -> Vec<Tile> {
        self.shared.tiles().await
    }

    /// Join a call: permission, session, transport, then local media.
    ///
    /// Blocking failures are presented through the alert sink and leave the
    /// connection state at `Failed`. A join abandoned by [`leave`](Self::leave)
    /// resolves to [`CallError::Cancelled`] without touching any state.
    pub async fn join(&self, call_id: &str) -> Result<(), CallError> {
        let requested = CallId::parse(call_id).ok();
        let stale = {
            let surface = self.shared.controls.lock().await;
            surface.is_attached() || surface.bound_call().is_some_and(|bound| Some(bound) != requested.as_ref())
        };
        if stale {
            tracing::info!("leaving current call before joining another");
            self.leave().await;
        }
        let ticket = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.run_join(call_id, ticket).await;
        if let Err(e) = &result {
            self.fail(ticket, e).await;
        }
        result
    }

    /// Re-run the last join from the first stage that has not completed.
    pub async fn retry(&self) -> Result<(), CallError> {
        let call_id = self.progress.lock().await.as_ref().map(|p| p.call_id.clone());
        match call_id {
            Some(call_id) => self.join(call_id.as_str()).await,
            None => Err(CallError::InvalidCallId("no call to retry".into())),
        }
    }

    async fn run_join(&self, raw_call_id: &str, ticket: u64) -> Result<(), CallError> {
        let call_id = CallId::parse(raw_call_id)?;
        let progress = {
            let mut guard = self.progress.lock().await;
            match guard.as_ref() {
                Some(p) if p.call_id == call_id => p.clone(),
                _ => {
                    let fresh = JoinProgress {
                        call_id: call_id.clone(),
                        permitted: false,
                        grant: None,
                    };
                    *guard = Some(fresh.clone());
                    fresh
                }
            }
        };
        tracing::info!("joining call {call_id}");

        if !progress.permitted {
            self.shared
                .set_connection(ticket, ConnectionState::RequestingPermission)
                .await?;
            let permission = request_call_permissions(self.platform.as_ref()).await;
            self.shared.ensure_current(ticket)?;
            permission?;
            self.record_progress(&call_id, |p| p.permitted = true).await;
        }

        let grant = match progress.grant {
            Some(grant) => {
                self.bind_call(ticket, &call_id).await?;
                grant
            }
            None => {
                self.shared
                    .set_connection(ticket, ConnectionState::AcquiringSession)
                    .await?;
                let grant = match self.backend.join_call(&call_id).await {
                    Ok(grant) => grant,
                    Err(e) => {
                        self.shared.ensure_current(ticket)?;
                        return Err(e);
                    }
                };
                if let Err(e) = self.bind_call(ticket, &call_id).await {
                    // Admitted after a leave that had nothing to report yet.
                    if let Err(leave_err) = self.backend.leave_call(&call_id).await {
                        tracing::warn!("ignoring leave failure for abandoned {call_id}: {leave_err}");
                    }
                    return Err(e);
                }
                self.record_progress(&call_id, |p| p.grant = Some(grant.clone())).await;
                grant
            }
        };

        self.shared.set_connection(ticket, ConnectionState::Connecting).await?;
        let server_url = websocket_url(grant.server_url.as_deref().unwrap_or(&self.transport_url))?;
        let connected = self.transport.connect(&server_url, &grant.access_token).await;
        if !self.shared.is_current(ticket) {
            if let Ok(connection) = connected {
                connection.controls.disconnect().await;
            }
            return Err(CallError::Cancelled);
        }
        let Connection {
            snapshot,
            events,
            controls,
        } = connected?;

        // The snapshot lands before the reconciliation task reads any event.
        let session = CallSession {
            call_id: call_id.clone(),
            metadata: grant.metadata.clone(),
        };
        let seeded = self
            .shared
            .update(ticket, |live| {
                live.state = apply_snapshot(
                    CallState::new().with_connection(ConnectionState::Connecting),
                    &snapshot,
                );
                live.session = Some(session);
            })
            .await;
        if let Err(e) = seeded {
            controls.disconnect().await;
            return Err(e);
        }

        let audio_only = grant.metadata.audio_only;
        if let Err(e) = self.enable_local_media(ticket, controls.as_ref(), audio_only).await {
            controls.disconnect().await;
            return Err(e);
        }

        {
            let mut surface = self.shared.controls.lock().await;
            if !self.shared.is_current(ticket) {
                drop(surface);
                controls.disconnect().await;
                return Err(CallError::Cancelled);
            }
            surface
                .attach(
                    controls.clone(),
                    LocalControlState {
                        mic_muted: false,
                        camera_muted: audio_only,
                    },
                )
                .await;
            // Once attached, a concurrent leave owns the disconnect.
            self.shared.set_connection(ticket, ConnectionState::Connected).await?;
            let task = tokio::spawn(reconcile(self.shared.clone(), ticket, events));
            if let Some(previous) = self
                .reconcile_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(task)
            {
                previous.abort();
            }
        }

        *self.progress.lock().await = None;
        self.shared
            .emitter
            .emit(CallEvent::LocalControlsChanged(self.local_controls().await));
        self.shared.emit_tiles().await;
        tracing::info!("joined call {call_id}");
        Ok(())
    }

    async fn enable_local_media(
        &self,
        ticket: u64,
        controls: &dyn TransportControls,
        audio_only: bool,
    ) -> Result<(), CallError> {
        let audio = controls.set_microphone_enabled(true).await;
        self.shared.ensure_current(ticket)?;
        audio.map_err(|e| CallError::TransportConnectFailed(format!("enable microphone: {e}")))?;

        if audio_only {
            tracing::debug!("audio-only call, camera stays off");
            return Ok(());
        }
        let video = controls.set_camera_enabled(true).await;
        self.shared.ensure_current(ticket)?;
        video.map_err(|e| CallError::TransportConnectFailed(format!("enable camera: {e}")))
    }

    /// Bind the admitted call to the control surface, unless a leave got there
    /// first. Checked under the controls lock so exactly one side reports
    /// the call to the backend.
    async fn bind_call(&self, ticket: u64, call_id: &CallId) -> Result<(), CallError> {
        let mut surface = self.shared.controls.lock().await;
        self.shared.ensure_current(ticket)?;
        surface.bind_call(call_id.clone());
        Ok(())
    }

    async fn record_progress<F>(&self, call_id: &CallId, f: F)
    where
        F: FnOnce(&mut JoinProgress),
    {
        if let Some(progress) = self.progress.lock().await.as_mut() {
            if &progress.call_id == call_id {
                f(progress);
            }
        }
    }

    async fn fail(&self, ticket: u64, err: &CallError) {
        if matches!(err, CallError::Cancelled) {
            tracing::info!("join abandoned");
            return;
        }
        tracing::warn!("join failed: {err}");
        let cleared = self
            .shared
            .update(ticket, |live| {
                live.state = CallState::new().with_connection(ConnectionState::Failed);
                live.session = None;
            })
            .await;
        if cleared.is_err() {
            return;
        }
        self.shared
            .emitter
            .emit(CallEvent::ConnectionStateChanged(ConnectionState::Failed));
        self.shared.emit_tiles().await;
        if err.class().is_blocking() {
            self.alerts.present(Alert::from_error(err));
        }
    }

    pub async fn toggle_microphone(&self) -> LocalControlState {
        let state = self.shared.controls.lock().await.toggle_microphone().await;
        self.shared.emitter.emit(CallEvent::LocalControlsChanged(state));
        self.shared.emit_tiles().await;
        state
    }

    pub async fn toggle_camera(&self) -> LocalControlState {
        let state = self.shared.controls.lock().await.toggle_camera().await;
        self.shared.emitter.emit(CallEvent::LocalControlsChanged(state));
        self.shared.emit_tiles().await;
        state
    }

    /// Feed one captured microphone frame into the published track.
    ///
    /// Returns false when the frame was dropped: no call, muted, or rejected.
    pub async fn push_audio_frame(&self, frame: &PcmFrame) -> bool {
        let target = self.shared.controls.lock().await.capture_target(TrackKind::Audio);
        let Some(transport) = target else {
            return false;
        };
        match transport.capture_audio(frame).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("dropping audio frame: {e}");
                false
            }
        }
    }

    /// Feed one captured camera frame into the published track.
    pub async fn push_video_frame(&self, frame: &I420Frame) -> bool {
        let target = self.shared.controls.lock().await.capture_target(TrackKind::Video);
        let Some(transport) = target else {
            return false;
        };
        match transport.capture_video(frame).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("dropping video frame: {e}");
                false
            }
        }
    }

    /// Start delivering decoded frames of a remote video publication, as
    /// named by a tile's `publication_sid`.
    pub async fn start_video_renderer(&self, publication_sid: &str, sink: Arc<dyn VideoSink>) -> Result<(), CallError> {
        let transport = self
            .shared
            .controls
            .lock()
            .await
            .transport()
            .ok_or_else(|| CallError::ControlCommandFailed("not connected".into()))?;
        transport.attach_video_sink(publication_sid, sink).await
    }

    pub async fn stop_video_renderer(&self, publication_sid: &str) {
        let transport = self.shared.controls.lock().await.transport();
        if let Some(transport) = transport {
            transport.detach_video_sink(publication_sid).await;
        }
    }

    /// Route decoded remote audio to `sink`, for this call and later ones.
    pub async fn set_audio_sink(&self, sink: Option<Arc<dyn AudioSink>>) {
        self.shared.controls.lock().await.set_audio_sink(sink).await;
    }

    /// Leave the call, or abandon a join still in flight. Always completes.
    pub async fn leave(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let task = self
            .reconcile_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        self.shared.controls.lock().await.leave().await;
        *self.progress.lock().await = None;

        {
            let mut live = self.shared.live.lock().await;
            live.state = CallState::new().with_connection(ConnectionState::Disconnected);
            live.session = None;
        }

        let emitter = &self.shared.emitter;
        emitter.emit(CallEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        emitter.emit(CallEvent::LocalControlsChanged(LocalControlState::default()));
        emitter.emit(CallEvent::TilesChanged(Vec::new()));
        emitter.emit(CallEvent::TeardownComplete);
        tracing::info!("teardown complete");
    }
}

/// Single consumer of transport events for one session.
async fn reconcile(shared: Arc<Shared>, ticket: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let disconnected = matches!(event, TransportEvent::Disconnected { .. });
        let applied = shared
            .update(ticket, |live| {
                live.state = apply(std::mem::take(&mut live.state), &event);
                if disconnected {
                    live.session = None;
                }
            })
            .await;
        if applied.is_err() {
            tracing::debug!("dropping event for abandoned session: {event:?}");
            break;
        }
        if disconnected {
            {
                let mut surface = shared.controls.lock().await;
                if shared.is_current(ticket) {
                    surface.detach().await;
                }
            }
            shared
                .emitter
                .emit(CallEvent::ConnectionStateChanged(ConnectionState::Disconnected));
            shared
                .emitter
                .emit(CallEvent::LocalControlsChanged(LocalControlState::default()));
        }
        shared.emit_tiles().await;
        if disconnected {
            break;
        }
    }
    tracing::info!("reconciliation loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as TestMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::alerts::RetryAction;
    use crate::backend::CallUser;
    use crate::controls::tests::RecordingControls;
    use crate::errors::ErrorClass;
    use crate::events::{Participant, TrackKind, TransportSnapshot};
    use crate::permissions::{Capability, CapabilityGrant};
    use crate::reconciler::tests::video;
    use crate::render::TileVideo;

    /// (reached, release) pair that holds a fake call open.
    type Gate = Option<(Arc<Notify>, Arc<Notify>)>;

    async fn pass(gate: &Gate) {
        if let Some((reached, release)) = gate {
            reached.notify_one();
            release.notified().await;
        }
    }

    fn gate() -> (Arc<Notify>, Arc<Notify>) {
        (Arc::new(Notify::new()), Arc::new(Notify::new()))
    }

    struct FakeBackend {
        join: TestMutex<Result<JoinGrant, CallError>>,
        fail_leave: bool,
        joins: AtomicUsize,
        leaves: AtomicUsize,
        gate: Gate,
    }

    impl FakeBackend {
        fn returning(join: Result<JoinGrant, CallError>) -> Arc<Self> {
            Arc::new(Self {
                join: TestMutex::new(join),
                fail_leave: false,
                joins: AtomicUsize::new(0),
                leaves: AtomicUsize::new(0),
                gate: None,
            })
        }
    }

    #[async_trait]
    impl CallBackend for FakeBackend {
        async fn join_call(&self, _call_id: &CallId) -> Result<JoinGrant, CallError> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            pass(&self.gate).await;
            self.join.lock().unwrap().clone()
        }

        async fn leave_call(&self, _call_id: &CallId) -> Result<(), CallError> {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            if self.fail_leave {
                Err(CallError::TeardownFailure("backend down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        snapshot: TransportSnapshot,
        controls: Arc<RecordingControls>,
        sender: TestMutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
        connects: AtomicUsize,
        failing_connects: AtomicUsize,
        gate: Gate,
        urls: TestMutex<Vec<String>>,
    }

    impl FakeTransport {
        fn send(&self, event: TransportEvent) {
            let sender = self.sender.lock().unwrap();
            sender.as_ref().expect("connected").send(event).unwrap();
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self, url: &str, _token: &str) -> Result<Connection, CallError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            pass(&self.gate).await;
            if self.failing_connects.load(Ordering::SeqCst) > 0 {
                self.failing_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(CallError::TransportConnectFailed("refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.sender.lock().unwrap() = Some(tx);
            Ok(Connection {
                snapshot: self.snapshot.clone(),
                events: rx,
                controls: self.controls.clone(),
            })
        }
    }

    struct FakePlatform {
        granted: AtomicBool,
        requests: AtomicUsize,
        gate: Gate,
    }

    #[async_trait]
    impl Platform for FakePlatform {
        async fn request_capabilities(&self, capabilities: &[Capability]) -> Vec<CapabilityGrant> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            pass(&self.gate).await;
            let granted = self.granted.load(Ordering::SeqCst);
            capabilities
                .iter()
                .map(|c| CapabilityGrant {
                    capability: *c,
                    granted,
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct CountingSink(AtomicUsize);

    impl VideoSink for CountingSink {
        fn on_frame(&self, _frame: I420Frame) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AudioSink for CountingSink {
        fn on_audio(&self, _publication_sid: &str, _frame: PcmFrame) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CapturedAlerts(TestMutex<Vec<Alert>>);

    impl AlertSink for CapturedAlerts {
        fn present(&self, alert: Alert) {
            self.0.lock().unwrap().push(alert);
        }
    }

    #[derive(Default)]
    struct CapturedEvents(TestMutex<Vec<CallEvent>>);

    impl CallEventListener for CapturedEvents {
        fn on_event(&self, event: CallEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn grant(audio_only: bool) -> JoinGrant {
        JoinGrant {
            metadata: CallMetadata {
                initiator: CallUser {
                    id: "alice".into(),
                    first_name: "Alice".into(),
                    last_name: "Martin".into(),
                },
                recipient: Some(CallUser {
                    id: "bob".into(),
                    first_name: "Bob".into(),
                    last_name: "Stone".into(),
                }),
                audio_only,
            },
            access_token: "token".into(),
            server_url: Some("https://rtc.example.com".into()),
        }
    }

    fn snapshot_with_bob() -> TransportSnapshot {
        TransportSnapshot {
            local: Some(Participant::local("alice")),
            participants: vec![Participant::remote("bob")],
            publications: vec![video("TR_b", "bob")],
        }
    }

    struct Harness {
        controller: Arc<CallController>,
        backend: Arc<FakeBackend>,
        transport: Arc<FakeTransport>,
        platform: Arc<FakePlatform>,
        alerts: Arc<CapturedAlerts>,
        events: Arc<CapturedEvents>,
    }

    fn harness(backend: Arc<FakeBackend>, transport: FakeTransport, granted: bool) -> Harness {
        gated_harness(backend, transport, granted, None)
    }

    fn gated_harness(backend: Arc<FakeBackend>, transport: FakeTransport, granted: bool, permission_gate: Gate) -> Harness {
        let transport = Arc::new(transport);
        let platform = Arc::new(FakePlatform {
            granted: AtomicBool::new(granted),
            requests: AtomicUsize::new(0),
            gate: permission_gate,
        });
        let alerts = Arc::new(CapturedAlerts::default());
        let events = Arc::new(CapturedEvents::default());
        let config = ClientConfig {
            current_user_id: Some("alice".into()),
            transport_url: "wss://fallback.example.com".into(),
            ..Default::default()
        };
        let controller = Arc::new(CallController::new(
            &config,
            backend.clone(),
            transport.clone(),
            platform.clone(),
            alerts.clone(),
        ));
        controller.add_listener(events.clone());
        Harness {
            controller,
            backend,
            transport,
            platform,
            alerts,
            events,
        }
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn ids(tiles: &[Tile]) -> Vec<&str> {
        tiles.iter().map(|t| t.participant_identity.as_str()).collect()
    }

    #[tokio::test]
    async fn join_renders_snapshot_then_streamed_participants() {
        let transport = FakeTransport {
            snapshot: snapshot_with_bob(),
            ..Default::default()
        };
        let h = harness(FakeBackend::returning(Ok(grant(false))), transport, true);

        h.controller.join("call-1").await.unwrap();
        assert_eq!(h.controller.connection_state().await, ConnectionState::Connected);
        assert_eq!(*h.transport.urls.lock().unwrap(), vec!["wss://rtc.example.com/"]);
        assert_eq!(
            *h.transport.controls.commands.lock().unwrap(),
            vec![("mic", true), ("camera", true)]
        );

        let tiles = h.controller.tiles().await;
        assert_eq!(ids(&tiles), vec!["alice", "bob"]);
        assert_eq!(tiles[0].label, "You");
        assert_eq!(tiles[1].label, "Bob Stone");
        assert_eq!(
            tiles[1].video,
            TileVideo::Live {
                publication_sid: "TR_b".into()
            }
        );

        h.transport
            .send(TransportEvent::ParticipantConnected(Participant::remote("carol")));
        let controller = h.controller.clone();
        wait_until(move || {
            let controller = controller.clone();
            async move { controller.tiles().await.len() == 3 }
        })
        .await;

        let tiles = h.controller.tiles().await;
        assert_eq!(ids(&tiles), vec!["alice", "bob", "carol"]);
        assert_eq!(tiles[2].video, TileVideo::NoVideo);
        assert!(
            h.events
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, CallEvent::TilesChanged(t) if t.len() == 3))
        );
    }

    #[tokio::test]
    async fn ended_call_is_classified_and_offers_refresh() {
        let h = harness(
            FakeBackend::returning(Err(CallError::CallAlreadyEnded)),
            FakeTransport::default(),
            true,
        );

        let err = h.controller.join("call-1").await.unwrap_err();
        assert_eq!(err, CallError::CallAlreadyEnded);
        assert_eq!(h.controller.connection_state().await, ConnectionState::Failed);
        assert_eq!(h.transport.connects.load(Ordering::SeqCst), 0);

        let alerts = h.alerts.0.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].class, ErrorClass::CallAlreadyEnded);
        assert_eq!(alerts[0].retry, RetryAction::Refresh);
    }

    #[tokio::test]
    async fn denied_permission_stops_before_backend() {
        let h = harness(FakeBackend::returning(Ok(grant(false))), FakeTransport::default(), false);

        let err = h.controller.join("call-1").await.unwrap_err();
        assert!(matches!(err, CallError::PermissionDenied(_)));
        assert_eq!(h.backend.joins.load(Ordering::SeqCst), 0);
        assert_eq!(h.alerts.0.lock().unwrap()[0].retry, RetryAction::Retry);
    }

    #[tokio::test]
    async fn invalid_call_id_fails_fast() {
        let h = harness(FakeBackend::returning(Ok(grant(false))), FakeTransport::default(), true);
        let err = h.controller.join("   ").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::SessionAcquisitionFailed);
        assert_eq!(h.platform.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_resumes_at_connect_stage() {
        let transport = FakeTransport {
            snapshot: snapshot_with_bob(),
            failing_connects: AtomicUsize::new(1),
            ..Default::default()
        };
        let h = harness(FakeBackend::returning(Ok(grant(false))), transport, true);

        let err = h.controller.join("call-1").await.unwrap_err();
        assert_eq!(err, CallError::TransportConnectFailed("refused".into()));
        assert_eq!(h.controller.connection_state().await, ConnectionState::Failed);

        h.controller.retry().await.unwrap();
        assert_eq!(h.controller.connection_state().await, ConnectionState::Connected);
        assert_eq!(h.platform.requests.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.joins.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn media_failure_after_connect_disconnects_transport() {
        let transport = FakeTransport::default();
        transport.controls.fail.store(true, Ordering::SeqCst);
        let h = harness(FakeBackend::returning(Ok(grant(false))), transport, true);

        let err = h.controller.join("call-1").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransportConnectFailed);
        assert_eq!(h.transport.controls.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.connection_state().await, ConnectionState::Failed);
        assert!(h.controller.session().await.is_none());
    }

    #[tokio::test]
    async fn audio_only_call_keeps_camera_off() {
        let h = harness(FakeBackend::returning(Ok(grant(true))), FakeTransport::default(), true);

        h.controller.join("call-1").await.unwrap();
        assert_eq!(*h.transport.controls.commands.lock().unwrap(), vec![("mic", true)]);
        assert!(h.controller.local_controls().await.camera_muted);
    }

    #[tokio::test]
    async fn leave_during_connect_discards_the_late_connection() {
        let (reached, release) = gate();
        let transport = FakeTransport {
            snapshot: snapshot_with_bob(),
            gate: Some((reached.clone(), release.clone())),
            ..Default::default()
        };
        let h = harness(FakeBackend::returning(Ok(grant(false))), transport, true);

        let (joined, ()) = tokio::join!(h.controller.join("call-1"), async {
            reached.notified().await;
            h.controller.leave().await;
            release.notify_one();
        });

        assert_eq!(joined.unwrap_err(), CallError::Cancelled);
        assert_eq!(h.transport.controls.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.connection_state().await, ConnectionState::Disconnected);
        assert!(h.controller.session().await.is_none());
        assert!(h.controller.tiles().await.is_empty());
        assert!(h.alerts.0.lock().unwrap().is_empty());
        assert!(h.transport.controls.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn leave_completes_even_when_backend_leave_fails() {
        let backend = Arc::new(FakeBackend {
            join: TestMutex::new(Ok(grant(false))),
            fail_leave: true,
            joins: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            gate: None,
        });
        let h = harness(backend, FakeTransport::default(), true);

        h.controller.join("call-1").await.unwrap();
        h.controller.leave().await;

        assert_eq!(h.backend.leaves.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.controls.disconnects.load(Ordering::SeqCst), 1);
        assert!(
            h.events
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, CallEvent::TeardownComplete))
        );
        assert_eq!(h.controller.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn leave_without_join_still_signals_teardown() {
        let h = harness(FakeBackend::returning(Ok(grant(false))), FakeTransport::default(), true);
        h.controller.leave().await;
        assert_eq!(h.backend.leaves.load(Ordering::SeqCst), 0);
        assert!(
            h.events
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, CallEvent::TeardownComplete))
        );
    }

    #[tokio::test]
    async fn transport_disconnect_clears_state() {
        let transport = FakeTransport {
            snapshot: snapshot_with_bob(),
            ..Default::default()
        };
        let h = harness(FakeBackend::returning(Ok(grant(false))), transport, true);
        h.controller.join("call-1").await.unwrap();

        h.transport.send(TransportEvent::Disconnected { reason: None });
        let controller = h.controller.clone();
        wait_until(move || {
            let controller = controller.clone();
            async move {
                controller.connection_state().await == ConnectionState::Disconnected
                    && !controller.shared.controls.lock().await.is_attached()
            }
        })
        .await;

        let state = h.controller.call_state().await;
        assert!(state.publications().is_empty());
        assert_eq!(state.roster().remote_count(), 0);
        assert!(h.controller.tiles().await.is_empty());
        assert!(h.controller.session().await.is_none());
        assert!(!h.controller.shared.controls.lock().await.is_attached());
        assert_eq!(h.controller.local_controls().await, LocalControlState::default());
        assert_eq!(h.transport.controls.disconnects.load(Ordering::SeqCst), 1);

        // The backend still hears about the call once the user leaves.
        h.controller.leave().await;
        assert_eq!(h.backend.leaves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn join_after_remote_disconnect_reports_previous_call() {
        let h = harness(FakeBackend::returning(Ok(grant(false))), FakeTransport::default(), true);
        h.controller.join("call-1").await.unwrap();
        h.transport.send(TransportEvent::Disconnected { reason: None });
        let controller = h.controller.clone();
        wait_until(move || {
            let controller = controller.clone();
            async move { controller.connection_state().await == ConnectionState::Disconnected }
        })
        .await;

        h.controller.join("call-2").await.unwrap();
        assert_eq!(h.backend.leaves.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.controller.session().await.map(|s| s.call_id),
            Some(CallId::parse("call-2").unwrap())
        );
    }

    #[tokio::test]
    async fn retry_after_denied_permission_asks_again() {
        let h = harness(FakeBackend::returning(Ok(grant(false))), FakeTransport::default(), false);

        let err = h.controller.join("call-1").await.unwrap_err();
        assert!(matches!(err, CallError::PermissionDenied(_)));

        h.platform.granted.store(true, Ordering::SeqCst);
        h.controller.retry().await.unwrap();
        assert_eq!(h.platform.requests.load(Ordering::SeqCst), 2);
        assert_eq!(h.backend.joins.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn ended_call_is_not_cached_on_retry() {
        let h = harness(
            FakeBackend::returning(Err(CallError::CallAlreadyEnded)),
            FakeTransport::default(),
            true,
        );
        assert_eq!(h.controller.join("call-1").await.unwrap_err(), CallError::CallAlreadyEnded);

        *h.backend.join.lock().unwrap() = Ok(grant(false));
        h.controller.retry().await.unwrap();
        assert_eq!(h.backend.joins.load(Ordering::SeqCst), 2);
        assert_eq!(h.platform.requests.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn leave_during_permission_prompt_cancels_join() {
        let (reached, release) = gate();
        let h = gated_harness(
            FakeBackend::returning(Ok(grant(false))),
            FakeTransport::default(),
            true,
            Some((reached.clone(), release.clone())),
        );

        let (joined, ()) = tokio::join!(h.controller.join("call-1"), async {
            reached.notified().await;
            h.controller.leave().await;
            release.notify_one();
        });

        assert_eq!(joined.unwrap_err(), CallError::Cancelled);
        assert_eq!(h.backend.joins.load(Ordering::SeqCst), 0);
        assert_eq!(h.backend.leaves.load(Ordering::SeqCst), 0);
        assert_eq!(h.controller.connection_state().await, ConnectionState::Disconnected);
        assert!(h.alerts.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn leave_during_session_request_notifies_backend() {
        let (reached, release) = gate();
        let backend = Arc::new(FakeBackend {
            join: TestMutex::new(Ok(grant(false))),
            fail_leave: false,
            joins: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            gate: Some((reached.clone(), release.clone())),
        });
        let h = harness(backend, FakeTransport::default(), true);

        let (joined, ()) = tokio::join!(h.controller.join("call-1"), async {
            reached.notified().await;
            h.controller.leave().await;
            release.notify_one();
        });

        assert_eq!(joined.unwrap_err(), CallError::Cancelled);
        assert_eq!(h.backend.joins.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.leaves.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.connects.load(Ordering::SeqCst), 0);
        assert!(h.controller.shared.controls.lock().await.bound_call().is_none());
        assert!(h.controller.session().await.is_none());
        assert!(h.alerts.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn captured_frames_reach_unmuted_tracks_only() {
        let h = harness(FakeBackend::returning(Ok(grant(false))), FakeTransport::default(), true);
        let pcm = PcmFrame {
            samples: vec![0; 480],
            sample_rate: 48_000,
            channels: 1,
        };
        let picture = I420Frame {
            width: 2,
            height: 2,
            y: vec![16; 4],
            u: vec![128],
            v: vec![128],
        };
        assert!(!h.controller.push_audio_frame(&pcm).await);

        h.controller.join("call-1").await.unwrap();
        assert!(h.controller.push_audio_frame(&pcm).await);
        assert!(h.controller.push_video_frame(&picture).await);

        h.controller.toggle_camera().await;
        assert!(!h.controller.push_video_frame(&picture).await);
        let broken = I420Frame { u: Vec::new(), ..picture };
        h.controller.toggle_camera().await;
        assert!(!h.controller.push_video_frame(&broken).await);

        assert_eq!(h.transport.controls.audio_frames.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.controls.video_frames.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn renderers_and_audio_sink_follow_the_call() {
        let h = harness(FakeBackend::returning(Ok(grant(false))), FakeTransport::default(), true);
        let sink = Arc::new(CountingSink::default());

        let err = h.controller.start_video_renderer("TR_b", sink.clone()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ControlCommandFailed);

        h.controller.set_audio_sink(Some(sink.clone() as Arc<dyn AudioSink>)).await;
        h.controller.join("call-1").await.unwrap();
        assert!(h.transport.controls.audio_sink.lock().unwrap().is_some());

        h.controller.start_video_renderer("TR_b", sink).await.unwrap();
        assert_eq!(*h.transport.controls.video_sinks.lock().unwrap(), vec!["TR_b"]);
        h.controller.stop_video_renderer("TR_b").await;
        assert!(h.transport.controls.video_sinks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn republished_camera_ends_bound_to_new_handle() {
        let transport = FakeTransport {
            snapshot: snapshot_with_bob(),
            ..Default::default()
        };
        let h = harness(FakeBackend::returning(Ok(grant(false))), transport, true);
        h.controller.join("call-1").await.unwrap();

        let mut fresh = video("TR_new", "bob");
        fresh.muted = true;
        for event in [
            TransportEvent::TrackMuted(video("TR_b", "bob")),
            TransportEvent::TrackUnsubscribed {
                sid: "TR_b".into(),
                participant_identity: "bob".into(),
                kind: TrackKind::Video,
            },
            TransportEvent::TrackSubscribed(fresh),
            TransportEvent::TrackUnmuted(video("TR_new", "bob")),
        ] {
            h.transport.send(event);
        }

        let controller = h.controller.clone();
        wait_until(move || {
            let controller = controller.clone();
            async move {
                controller.tiles().await.get(1).map(|t| t.video.clone())
                    == Some(TileVideo::Live {
                        publication_sid: "TR_new".into(),
                    })
            }
        })
        .await;
        assert!(h.controller.call_state().await.publication("TR_b").is_none());
    }

    #[tokio::test]
    async fn toggles_update_local_tile() {
        let transport = FakeTransport {
            snapshot: snapshot_with_bob(),
            ..Default::default()
        };
        let h = harness(FakeBackend::returning(Ok(grant(false))), transport, true);
        h.controller.join("call-1").await.unwrap();

        h.transport.send(TransportEvent::LocalTrackPublished {
            sid: "TR_cam".into(),
            kind: TrackKind::Video,
        });
        let controller = h.controller.clone();
        wait_until(move || {
            let controller = controller.clone();
            async move { controller.call_state().await.local_video().is_some() }
        })
        .await;

        let state = h.controller.toggle_camera().await;
        assert!(state.camera_muted);
        let state = h.controller.toggle_microphone().await;
        assert!(state.mic_muted);

        let local = h.controller.tiles().await.remove(0);
        assert_eq!(local.video, TileVideo::NoVideo);
        assert!(local.audio_muted);
        assert_eq!(
            h.transport.controls.commands.lock().unwrap()[2..],
            [("camera", false), ("mic", false)]
        );
    }
}
