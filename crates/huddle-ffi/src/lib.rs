//! UniFFI bindings for huddle-core.
//!
//! Provides a HuddleClient object that wraps the call controller and the
//! persisted client config into a single FFI-safe interface.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use async_trait::async_trait;
use huddle_core::{
    self,
    alerts::{Alert as CoreAlert, RetryAction as CoreRetryAction},
    errors::{CallError, ErrorClass as CoreErrorClass},
    events::{
        CallEvent as CoreCallEvent, ConnectionState as CoreConnectionState,
        LocalControlState as CoreLocalControlState,
    },
    media::{I420Frame, PcmFrame},
    permissions::{Capability as CoreCapability, CapabilityGrant as CoreCapabilityGrant},
    render::{Tile as CoreTile, TileVideo as CoreTileVideo},
};

uniffi::include_scaffolding!("huddle");

// ── Namespace functions ──────────────────────────────────────────────

/// Initialize tracing/logging. Call once from the host before using HuddleClient.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("huddle_core=debug,huddle_ffi=debug")),
            )
            .with_ansi(false)
            .init();
    });
}

// ── FFI-safe type conversions ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    RequestingPermission,
    AcquiringSession,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl From<CoreConnectionState> for ConnectionState {
    fn from(s: CoreConnectionState) -> Self {
        match s {
            CoreConnectionState::Idle => Self::Idle,
            CoreConnectionState::RequestingPermission => Self::RequestingPermission,
            CoreConnectionState::AcquiringSession => Self::AcquiringSession,
            CoreConnectionState::Connecting => Self::Connecting,
            CoreConnectionState::Connected => Self::Connected,
            CoreConnectionState::Disconnected => Self::Disconnected,
            CoreConnectionState::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Camera,
    Microphone,
}

impl From<CoreCapability> for Capability {
    fn from(c: CoreCapability) -> Self {
        match c {
            CoreCapability::Camera => Self::Camera,
            CoreCapability::Microphone => Self::Microphone,
        }
    }
}

impl From<Capability> for CoreCapability {
    fn from(c: Capability) -> Self {
        match c {
            Capability::Camera => Self::Camera,
            Capability::Microphone => Self::Microphone,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityGrant {
    pub capability: Capability,
    pub granted: bool,
}

impl From<CapabilityGrant> for CoreCapabilityGrant {
    fn from(g: CapabilityGrant) -> Self {
        Self {
            capability: g.capability.into(),
            granted: g.granted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalControlState {
    pub mic_muted: bool,
    pub camera_muted: bool,
}

impl From<CoreLocalControlState> for LocalControlState {
    fn from(s: CoreLocalControlState) -> Self {
        Self {
            mic_muted: s.mic_muted,
            camera_muted: s.camera_muted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileVideo {
    Live { publication_sid: String },
    NoVideo,
}

impl From<CoreTileVideo> for TileVideo {
    fn from(v: CoreTileVideo) -> Self {
        match v {
            CoreTileVideo::Live { publication_sid } => Self::Live { publication_sid },
            CoreTileVideo::NoVideo => Self::NoVideo,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tile {
    pub participant_identity: String,
    pub label: String,
    pub is_local: bool,
    pub audio_muted: bool,
    pub video: TileVideo,
}

impl From<CoreTile> for Tile {
    fn from(t: CoreTile) -> Self {
        Self {
            participant_identity: t.participant_identity,
            label: t.label,
            is_local: t.is_local,
            audio_muted: t.audio_muted,
            video: t.video.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    PermissionDenied,
    SessionAcquisitionFailed,
    CallAlreadyEnded,
    TransportConnectFailed,
    ControlCommandFailed,
    TeardownFailure,
    Cancelled,
}

impl From<CoreErrorClass> for ErrorClass {
    fn from(c: CoreErrorClass) -> Self {
        match c {
            CoreErrorClass::PermissionDenied => Self::PermissionDenied,
            CoreErrorClass::SessionAcquisitionFailed => Self::SessionAcquisitionFailed,
            CoreErrorClass::CallAlreadyEnded => Self::CallAlreadyEnded,
            CoreErrorClass::TransportConnectFailed => Self::TransportConnectFailed,
            CoreErrorClass::ControlCommandFailed => Self::ControlCommandFailed,
            CoreErrorClass::TeardownFailure => Self::TeardownFailure,
            CoreErrorClass::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Refresh,
    None,
}

impl From<CoreRetryAction> for RetryAction {
    fn from(a: CoreRetryAction) -> Self {
        match a {
            CoreRetryAction::Retry => Self::Retry,
            CoreRetryAction::Refresh => Self::Refresh,
            CoreRetryAction::None => Self::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub classification: ErrorClass,
    pub message: String,
    pub retry: RetryAction,
}

impl From<CoreAlert> for Alert {
    fn from(a: CoreAlert) -> Self {
        Self {
            classification: a.class.into(),
            message: a.message,
            retry: a.retry.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    ConnectionStateChanged { state: ConnectionState },
    TilesChanged { tiles: Vec<Tile> },
    LocalControlsChanged { controls: LocalControlState },
    TeardownComplete,
}

impl From<CoreCallEvent> for CallEvent {
    fn from(e: CoreCallEvent) -> Self {
        match e {
            CoreCallEvent::ConnectionStateChanged(state) => Self::ConnectionStateChanged { state: state.into() },
            CoreCallEvent::TilesChanged(tiles) => Self::TilesChanged {
                tiles: tiles.into_iter().map(Tile::from).collect(),
            },
            CoreCallEvent::LocalControlsChanged(controls) => Self::LocalControlsChanged {
                controls: controls.into(),
            },
            CoreCallEvent::TeardownComplete => Self::TeardownComplete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u32,
}

impl From<AudioFrame> for PcmFrame {
    fn from(f: AudioFrame) -> Self {
        Self {
            samples: f.samples,
            sample_rate: f.sample_rate,
            channels: f.channels,
        }
    }
}

impl From<PcmFrame> for AudioFrame {
    fn from(f: PcmFrame) -> Self {
        Self {
            samples: f.samples,
            sample_rate: f.sample_rate,
            channels: f.channels,
        }
    }
}

/// Tightly packed I420 planes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl From<VideoFrame> for I420Frame {
    fn from(f: VideoFrame) -> Self {
        Self {
            width: f.width,
            height: f.height,
            y: f.y,
            u: f.u,
            v: f.v,
        }
    }
}

impl From<I420Frame> for VideoFrame {
    fn from(f: I420Frame) -> Self {
        Self {
            width: f.width,
            height: f.height,
            y: f.y,
            u: f.u,
            v: f.v,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    #[error("Permission denied: {msg}")]
    PermissionDenied { msg: String },
    #[error("Session acquisition failed: {msg}")]
    SessionAcquisitionFailed { msg: String },
    #[error("Call already ended: {msg}")]
    CallAlreadyEnded { msg: String },
    #[error("Transport connect failed: {msg}")]
    TransportConnectFailed { msg: String },
    #[error("Control command failed: {msg}")]
    ControlCommandFailed { msg: String },
    #[error("Teardown failure: {msg}")]
    TeardownFailure { msg: String },
    #[error("Cancelled: {msg}")]
    Cancelled { msg: String },
    #[error("Not configured: {msg}")]
    NotConfigured { msg: String },
}

impl From<CallError> for HuddleError {
    fn from(e: CallError) -> Self {
        tracing::error!("CallError: {e}");
        let msg = e.to_string();
        match e {
            CallError::PermissionDenied(_) => Self::PermissionDenied { msg },
            CallError::InvalidCallId(_) | CallError::SessionAcquisitionFailed(_) => {
                Self::SessionAcquisitionFailed { msg }
            }
            CallError::CallAlreadyEnded => Self::CallAlreadyEnded { msg },
            CallError::TransportConnectFailed(_) => Self::TransportConnectFailed { msg },
            CallError::ControlCommandFailed(_) => Self::ControlCommandFailed { msg },
            CallError::TeardownFailure(_) => Self::TeardownFailure { msg },
            CallError::Cancelled => Self::Cancelled { msg },
        }
    }
}

// ── Callback interfaces ────────────────────────────────────────────────

pub trait CallEventListener: Send + Sync {
    fn on_event(&self, event: CallEvent);
}

pub trait PermissionProvider: Send + Sync {
    fn request_capabilities(&self, capabilities: Vec<Capability>) -> Vec<CapabilityGrant>;
}

pub trait AlertPresenter: Send + Sync {
    fn present(&self, alert: Alert);
}

pub trait VideoFrameSink: Send + Sync {
    fn on_frame(&self, frame: VideoFrame);
}

pub trait AudioPlayoutSink: Send + Sync {
    fn on_audio(&self, publication_sid: String, frame: AudioFrame);
}

// ── Bridges: FFI callback → core collaborator ─────────────────────────

struct BridgeListener {
    ffi_listener: Arc<dyn CallEventListener>,
}

impl huddle_core::CallEventListener for BridgeListener {
    fn on_event(&self, event: CoreCallEvent) {
        self.ffi_listener.on_event(event.into());
    }
}

struct BridgePlatform {
    provider: Arc<dyn PermissionProvider>,
}

#[async_trait]
impl huddle_core::Platform for BridgePlatform {
    async fn request_capabilities(&self, capabilities: &[CoreCapability]) -> Vec<CoreCapabilityGrant> {
        let requested = capabilities.iter().copied().map(Capability::from).collect();
        let provider = self.provider.clone();
        // The host may block on a system prompt.
        match tokio::task::spawn_blocking(move || provider.request_capabilities(requested)).await {
            Ok(grants) => grants.into_iter().map(CoreCapabilityGrant::from).collect(),
            Err(e) => {
                tracing::warn!("permission provider failed: {e}");
                Vec::new()
            }
        }
    }
}

struct BridgeAlerts {
    presenter: Arc<dyn AlertPresenter>,
}

impl huddle_core::AlertSink for BridgeAlerts {
    fn present(&self, alert: CoreAlert) {
        self.presenter.present(alert.into());
    }
}

struct BridgeVideoSink {
    sink: Box<dyn VideoFrameSink>,
}

impl huddle_core::VideoSink for BridgeVideoSink {
    fn on_frame(&self, frame: I420Frame) {
        self.sink.on_frame(frame.into());
    }
}

struct BridgeAudioSink {
    sink: Box<dyn AudioPlayoutSink>,
}

impl huddle_core::AudioSink for BridgeAudioSink {
    fn on_audio(&self, publication_sid: &str, frame: PcmFrame) {
        self.sink.on_audio(publication_sid.to_string(), frame.into());
    }
}

// ── HuddleClient: main FFI object ──────────────────────────────────────

pub struct HuddleClient {
    config: huddle_core::ConfigStore,
    platform: Arc<dyn huddle_core::Platform>,
    alerts: Arc<dyn huddle_core::AlertSink>,
    listeners: StdMutex<Vec<Arc<dyn huddle_core::CallEventListener>>>,
    audio_sink: StdMutex<Option<Arc<dyn huddle_core::AudioSink>>>,
    controller: RwLock<Option<Arc<huddle_core::CallController>>>,
    rt: tokio::runtime::Runtime,
}

impl HuddleClient {
    pub fn new(
        data_dir: String,
        permissions: Box<dyn PermissionProvider>,
        alerts: Box<dyn AlertPresenter>,
    ) -> Result<Self, HuddleError> {
        let rt = tokio::runtime::Runtime::new().map_err(|e| HuddleError::NotConfigured {
            msg: format!("failed to create tokio runtime: {e}"),
        })?;
        let client = Self {
            config: huddle_core::ConfigStore::new(&data_dir),
            platform: Arc::new(BridgePlatform {
                provider: Arc::from(permissions),
            }),
            alerts: Arc::new(BridgeAlerts {
                presenter: Arc::from(alerts),
            }),
            listeners: StdMutex::new(Vec::new()),
            audio_sink: StdMutex::new(None),
            controller: RwLock::new(None),
            rt,
        };
        if let Err(e) = client.rebuild_controller() {
            tracing::info!("client not configured yet: {e}");
        }
        Ok(client)
    }

    /// Persist connection settings and rebuild the controller.
    ///
    /// A call in progress is left first.
    pub fn configure(
        &self,
        api_base_url: String,
        api_token: Option<String>,
        transport_url: String,
        current_user_id: Option<String>,
        language: Option<String>,
    ) -> Result<(), HuddleError> {
        if let Some(controller) = self.controller() {
            self.rt.block_on(controller.leave());
        }
        self.config.set_api(api_base_url, api_token);
        self.config.set_transport_url(transport_url);
        self.config.set_current_user_id(current_user_id);
        self.config.set_language(language);
        self.rebuild_controller()
    }

    fn rebuild_controller(&self) -> Result<(), HuddleError> {
        let controller = huddle_core::CallController::with_defaults(
            &self.config.get(),
            self.platform.clone(),
            self.alerts.clone(),
        );
        let controller = match controller {
            Ok(controller) => Arc::new(controller),
            Err(e) => {
                *self.controller.write().unwrap_or_else(PoisonError::into_inner) = None;
                return Err(HuddleError::NotConfigured { msg: e.to_string() });
            }
        };
        for listener in self.listeners.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            controller.add_listener(listener.clone());
        }
        let audio_sink = self.audio_sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if audio_sink.is_some() {
            self.rt.block_on(controller.set_audio_sink(audio_sink));
        }
        *self.controller.write().unwrap_or_else(PoisonError::into_inner) = Some(controller);
        Ok(())
    }

    fn controller(&self) -> Option<Arc<huddle_core::CallController>> {
        self.controller.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn configured(&self) -> Result<Arc<huddle_core::CallController>, HuddleError> {
        self.controller().ok_or_else(|| HuddleError::NotConfigured {
            msg: "api base url is not set".into(),
        })
    }

    pub fn join(&self, call_id: String) -> Result<(), HuddleError> {
        let controller = self.configured()?;
        self.rt.block_on(controller.join(&call_id)).map_err(HuddleError::from)
    }

    pub fn retry(&self) -> Result<(), HuddleError> {
        let controller = self.configured()?;
        self.rt.block_on(controller.retry()).map_err(HuddleError::from)
    }

    pub fn leave(&self) {
        if let Some(controller) = self.controller() {
            self.rt.block_on(controller.leave());
        }
    }

    pub fn toggle_microphone(&self) -> LocalControlState {
        match self.controller() {
            Some(controller) => self.rt.block_on(controller.toggle_microphone()).into(),
            None => CoreLocalControlState::default().into(),
        }
    }

    pub fn toggle_camera(&self) -> LocalControlState {
        match self.controller() {
            Some(controller) => self.rt.block_on(controller.toggle_camera()).into(),
            None => CoreLocalControlState::default().into(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.controller() {
            Some(controller) => self.rt.block_on(controller.connection_state()).into(),
            None => ConnectionState::Idle,
        }
    }

    pub fn local_controls(&self) -> LocalControlState {
        match self.controller() {
            Some(controller) => self.rt.block_on(controller.local_controls()).into(),
            None => CoreLocalControlState::default().into(),
        }
    }

    pub fn tiles(&self) -> Vec<Tile> {
        match self.controller() {
            Some(controller) => self
                .rt
                .block_on(controller.tiles())
                .into_iter()
                .map(Tile::from)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn add_listener(&self, listener: Box<dyn CallEventListener>) {
        let bridge: Arc<dyn huddle_core::CallEventListener> = Arc::new(BridgeListener {
            ffi_listener: Arc::from(listener),
        });
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bridge.clone());
        if let Some(controller) = self.controller() {
            controller.add_listener(bridge);
        }
    }

    /// Feed one microphone frame. False when it was dropped.
    pub fn push_audio_frame(&self, frame: AudioFrame) -> bool {
        match self.controller() {
            Some(controller) => self.rt.block_on(controller.push_audio_frame(&frame.into())),
            None => false,
        }
    }

    /// Feed one camera frame. False when it was dropped.
    pub fn push_video_frame(&self, frame: VideoFrame) -> bool {
        match self.controller() {
            Some(controller) => self.rt.block_on(controller.push_video_frame(&frame.into())),
            None => false,
        }
    }

    pub fn start_video_renderer(&self, publication_sid: String, sink: Box<dyn VideoFrameSink>) -> Result<(), HuddleError> {
        let controller = self.configured()?;
        tracing::info!("starting video renderer for {publication_sid}");
        let sink = Arc::new(BridgeVideoSink { sink });
        self.rt
            .block_on(controller.start_video_renderer(&publication_sid, sink))
            .map_err(HuddleError::from)
    }

    pub fn stop_video_renderer(&self, publication_sid: String) {
        if let Some(controller) = self.controller() {
            tracing::info!("stopping video renderer for {publication_sid}");
            self.rt.block_on(controller.stop_video_renderer(&publication_sid));
        }
    }

    /// Route decoded remote audio to the host's playout.
    pub fn set_audio_sink(&self, sink: Box<dyn AudioPlayoutSink>) {
        let sink: Arc<dyn huddle_core::AudioSink> = Arc::new(BridgeAudioSink { sink });
        self.replace_audio_sink(Some(sink));
    }

    pub fn clear_audio_sink(&self) {
        self.replace_audio_sink(None);
    }

    fn replace_audio_sink(&self, sink: Option<Arc<dyn huddle_core::AudioSink>>) {
        *self.audio_sink.lock().unwrap_or_else(PoisonError::into_inner) = sink.clone();
        if let Some(controller) = self.controller() {
            self.rt.block_on(controller.set_audio_sink(sink));
        }
    }
}
