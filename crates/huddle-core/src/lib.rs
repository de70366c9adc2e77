//! Huddle call core.
//!
//! Turns a join request into a live multi-participant call and keeps one
//! consistent, renderable view of it while transport events stream in.
//! Platform-free; consumed by native UI shells via UniFFI bindings.

pub mod alerts;
pub mod backend;
pub mod config;
pub mod controls;
pub mod errors;
pub mod events;
pub mod livekit_transport;
pub mod media;
pub mod names;
pub mod participants;
pub mod permissions;
pub mod reconciler;
pub mod render;
pub mod session;
pub mod transport;

pub use alerts::{Alert, AlertSink, LogAlertSink, RetryAction};
pub use backend::{CallBackend, CallId, CallMetadata, CallUser, HttpBackend, JoinGrant};
pub use config::{ClientConfig, ConfigStore};
pub use controls::ControlSurface;
pub use errors::{CallError, ErrorClass};
pub use events::{
    CallEvent, CallEventListener, ConnectionState, LocalControlState, Participant, TrackKind,
    TrackPublication, TransportEvent, TransportSnapshot,
};
pub use livekit_transport::LiveKitTransport;
pub use media::{AudioSink, I420Frame, PcmFrame, VideoSink};
pub use names::{Labels, NameContext};
pub use permissions::{Capability, CapabilityGrant, Platform};
pub use reconciler::{CallState, apply, apply_snapshot};
pub use render::{Tile, TileVideo};
pub use session::{CallController, CallSession};
pub use transport::{Connection, Transport, TransportControls};
