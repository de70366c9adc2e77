use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::errors::CallError;
use crate::events::{TransportEvent, TransportSnapshot};
use crate::media::{AudioSink, I420Frame, PcmFrame, VideoSink};

/// A live connection to the real-time transport.
///
/// `snapshot` must be folded into call state before anything is read from
/// `events`; connecting and listening are not atomic on the transport side.
pub struct Connection {
    pub snapshot: TransportSnapshot,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub controls: Arc<dyn TransportControls>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str, token: &str) -> Result<Connection, CallError>;
}

/// Commands the local participant can issue on an open connection.
#[async_trait]
pub trait TransportControls: Send + Sync {
    async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), CallError>;

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError>;

    /// Feed one captured microphone frame into the published audio track.
    async fn capture_audio(&self, frame: &PcmFrame) -> Result<(), CallError>;

    /// Feed one captured camera frame into the published video track.
    async fn capture_video(&self, frame: &I420Frame) -> Result<(), CallError>;

    /// Start delivering decoded frames of a remote video publication to `sink`,
    /// replacing any sink already attached to it.
    async fn attach_video_sink(&self, publication_sid: &str, sink: Arc<dyn VideoSink>) -> Result<(), CallError>;

    async fn detach_video_sink(&self, publication_sid: &str);

    /// Where decoded remote audio goes; `None` drops it.
    async fn set_audio_sink(&self, sink: Option<Arc<dyn AudioSink>>);

    /// Close the connection. Safe to call more than once.
    async fn disconnect(&self);
}

/// Normalize a server address to a WebSocket URL (`https` becomes `wss`).
pub fn websocket_url(server_url: &str) -> Result<String, CallError> {
    let mut url = Url::parse(server_url.trim())
        .map_err(|e| CallError::TransportConnectFailed(format!("invalid server url '{server_url}': {e}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(CallError::TransportConnectFailed(format!(
                "unsupported server url scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| CallError::TransportConnectFailed(format!("cannot use scheme {scheme}")))?;
    Ok(url.to_string())
}
