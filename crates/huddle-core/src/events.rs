use std::sync::{Arc, PoisonError, RwLock};

use crate::render::Tile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    RequestingPermission,
    AcquiringSession,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// An identity attached to the call. Unique by `identity` within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub identity: String,
    pub is_local: bool,
    /// Name announced by the participant itself, if any.
    pub name: Option<String>,
    /// Raw metadata blob as published on the transport.
    pub metadata: Option<String>,
}

impl Participant {
    pub fn remote(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            is_local: false,
            name: None,
            metadata: None,
        }
    }

    pub fn local(identity: impl Into<String>) -> Self {
        Self {
            is_local: true,
            ..Self::remote(identity)
        }
    }
}

/// A handle for one participant's media stream of a given kind.
///
/// Identity is `sid`, not `(participant, kind)`: a participant that republishes
/// gets a new handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPublication {
    pub sid: String,
    pub participant_identity: String,
    pub kind: TrackKind,
    pub subscribed: bool,
    pub muted: bool,
    pub has_track: bool,
}

impl TrackPublication {
    /// Subscribed, backed by a track, and not muted.
    pub fn is_eligible(&self) -> bool {
        self.subscribed && self.has_track && !self.muted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalControlState {
    pub mic_muted: bool,
    pub camera_muted: bool,
}

/// Remote participants and their publications as seen at connect time.
#[derive(Debug, Clone, Default)]
pub struct TransportSnapshot {
    pub local: Option<Participant>,
    pub participants: Vec<Participant>,
    pub publications: Vec<TrackPublication>,
}

/// Everything the transport reports after connect, as one tagged union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ParticipantConnected(Participant),
    ParticipantDisconnected { identity: String },
    TrackSubscribed(TrackPublication),
    TrackUnsubscribed {
        sid: String,
        participant_identity: String,
        kind: TrackKind,
    },
    TrackMuted(TrackPublication),
    TrackUnmuted(TrackPublication),
    LocalTrackPublished { sid: String, kind: TrackKind },
    LocalTrackUnpublished { sid: String, kind: TrackKind },
    Disconnected { reason: Option<String> },
}

/// Events emitted by the core to UI listeners.
#[derive(Debug, Clone)]
pub enum CallEvent {
    ConnectionStateChanged(ConnectionState),
    TilesChanged(Vec<Tile>),
    LocalControlsChanged(LocalControlState),
    TeardownComplete,
}

/// Implementations must be Send + Sync (called from tokio tasks).
pub trait CallEventListener: Send + Sync {
    fn on_event(&self, event: CallEvent);
}

/// Dispatches [`CallEvent`]s to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn CallEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: CallEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
