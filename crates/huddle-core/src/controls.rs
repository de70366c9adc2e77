use std::sync::Arc;

use crate::backend::{CallBackend, CallId};
use crate::errors::CallError;
use crate::events::{LocalControlState, TrackKind};
use crate::media::AudioSink;
use crate::transport::TransportControls;

/// Local mute/camera/leave controls.
///
/// Toggles are optimistic: the local flag flips first, then exactly one
/// command carrying the new enabled value goes to the transport. A failed
/// command is logged and the flag stays as set.
pub struct ControlSurface {
    backend: Arc<dyn CallBackend>,
    state: LocalControlState,
    transport: Option<Arc<dyn TransportControls>>,
    call_id: Option<CallId>,
    audio_sink: Option<Arc<dyn AudioSink>>,
}

impl ControlSurface {
    pub fn new(backend: Arc<dyn CallBackend>) -> Self {
        Self {
            backend,
            state: LocalControlState::default(),
            transport: None,
            call_id: None,
            audio_sink: None,
        }
    }

    /// Remember the call the backend admitted us to, so leave can report it.
    pub fn bind_call(&mut self, call_id: CallId) {
        self.call_id = Some(call_id);
    }

    pub fn bound_call(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    /// Take over the transport of a freshly connected call.
    pub async fn attach(&mut self, transport: Arc<dyn TransportControls>, initial: LocalControlState) {
        if let Some(sink) = &self.audio_sink {
            transport.set_audio_sink(Some(sink.clone())).await;
        }
        self.transport = Some(transport);
        self.state = initial;
    }

    /// Drop a transport that went away on its own.
    ///
    /// The bound call is kept so a later leave still reports it.
    pub async fn detach(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
        }
        self.state = LocalControlState::default();
    }

    /// Route remote audio of this and every later call to `sink`.
    pub async fn set_audio_sink(&mut self, sink: Option<Arc<dyn AudioSink>>) {
        self.audio_sink = sink.clone();
        if let Some(transport) = &self.transport {
            transport.set_audio_sink(sink).await;
        }
    }

    pub fn transport(&self) -> Option<Arc<dyn TransportControls>> {
        self.transport.clone()
    }

    /// Transport accepting captured frames of `kind`, unless that device is muted.
    pub fn capture_target(&self, kind: TrackKind) -> Option<Arc<dyn TransportControls>> {
        let muted = match kind {
            TrackKind::Audio => self.state.mic_muted,
            TrackKind::Video => self.state.camera_muted,
        };
        if muted { None } else { self.transport.clone() }
    }

    pub fn state(&self) -> LocalControlState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    pub async fn toggle_microphone(&mut self) -> LocalControlState {
        self.state.mic_muted = !self.state.mic_muted;
        let enabled = !self.state.mic_muted;
        if let Err(e) = self.send(|t| async move { t.set_microphone_enabled(enabled).await }).await {
            tracing::warn!("toggle microphone to {enabled}: {e}");
        }
        self.state
    }

    pub async fn toggle_camera(&mut self) -> LocalControlState {
        self.state.camera_muted = !self.state.camera_muted;
        let enabled = !self.state.camera_muted;
        if let Err(e) = self.send(|t| async move { t.set_camera_enabled(enabled).await }).await {
            tracing::warn!("toggle camera to {enabled}: {e}");
        }
        self.state
    }

    async fn send<F, Fut>(&self, command: F) -> Result<(), CallError>
    where
        F: FnOnce(Arc<dyn TransportControls>) -> Fut,
        Fut: Future<Output = Result<(), CallError>>,
    {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| CallError::ControlCommandFailed("not connected".into()))?;
        command(transport).await.map_err(|e| match e {
            CallError::ControlCommandFailed(_) => e,
            other => CallError::ControlCommandFailed(other.to_string()),
        })
    }

    /// Disconnect, notify the backend, reset. Never fails.
    ///
    /// The backend notification is best-effort; its failure is logged and
    /// swallowed so that leaving always completes.
    pub async fn leave(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
        }

        if let Some(call_id) = self.call_id.take() {
            match self.backend.leave_call(&call_id).await {
                Ok(()) => tracing::info!("left call {call_id}"),
                Err(e) => {
                    let e = match e {
                        CallError::TeardownFailure(_) => e,
                        other => CallError::TeardownFailure(other.to_string()),
                    };
                    tracing::warn!("ignoring leave failure for {call_id}: {e}");
                }
            }
        }

        self.state = LocalControlState::default();
    }
}
