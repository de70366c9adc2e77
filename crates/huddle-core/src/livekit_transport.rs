//! LiveKit implementation of the transport contract.
//!
//! Room events are translated into [`TransportEvent`]s on a forwarding task;
//! everything downstream stays LiveKit-agnostic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use livekit::options::TrackPublishOptions;
use livekit::prelude::{
    LocalAudioTrack, LocalTrack, LocalVideoTrack, Participant as LkParticipant, RemoteParticipant,
    RemoteTrackPublication, Room, RoomEvent, RoomOptions, TrackPublication as LkTrackPublication,
};
use livekit::track::{RemoteTrack, TrackKind as LkTrackKind, TrackSource as LkTrackSource};
use livekit::webrtc::audio_frame::AudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit::webrtc::prelude::*;
use livekit::webrtc::video_source::native::NativeVideoSource;
use livekit::webrtc::video_stream::native::NativeVideoStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::errors::CallError;
use crate::events::{Participant, TrackKind, TrackPublication, TransportEvent, TransportSnapshot};
use crate::media::{AudioSink, I420Frame, PcmFrame, VideoSink};
use crate::transport::{Connection, Transport, TransportControls};

const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u32 = 1;
const AUDIO_QUEUE_SIZE_MS: u32 = 100;

const VIDEO_WIDTH: u32 = 1280;
const VIDEO_HEIGHT: u32 = 720;

/// Connects to a LiveKit server with auto-subscribe enabled.
#[derive(Default)]
pub struct LiveKitTransport;

impl LiveKitTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LiveKitTransport {
    async fn connect(&self, url: &str, token: &str) -> Result<Connection, CallError> {
        let mut options = RoomOptions::default();
        options.auto_subscribe = true;

        let (room, room_events) = Room::connect(url, token, options)
            .await
            .map_err(|e| CallError::TransportConnectFailed(e.to_string()))?;
        let room = Arc::new(room);
        let media = Arc::new(RemoteMedia::default());

        let snapshot = snapshot_room(&room, &media);
        tracing::info!(
            "connected to {url}: {} remote participants, {} publications",
            snapshot.participants.len(),
            snapshot.publications.len()
        );

        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(room_events, tx, media.clone()));

        Ok(Connection {
            snapshot,
            events,
            controls: Arc::new(LiveKitControls::new(room, media)),
        })
    }
}

/// Subscribed remote tracks and the tasks pulling decoded media out of them,
/// keyed by publication sid.
#[derive(Default)]
struct RemoteMedia {
    audio_sink: StdMutex<Option<Arc<dyn AudioSink>>>,
    audio_streams: StdMutex<HashMap<String, JoinHandle<()>>>,
    video_tracks: StdMutex<HashMap<String, RemoteTrack>>,
    renderers: StdMutex<HashMap<String, JoinHandle<()>>>,
}

impl RemoteMedia {
    fn audio_sink(&self) -> Option<Arc<dyn AudioSink>> {
        self.audio_sink.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_audio_sink(&self, sink: Option<Arc<dyn AudioSink>>) {
        *self.audio_sink.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    fn track_subscribed(self: &Arc<Self>, sid: String, track: RemoteTrack) {
        match &track {
            RemoteTrack::Audio(audio_track) => {
                let mut stream = NativeAudioStream::new(
                    audio_track.rtc_track(),
                    AUDIO_SAMPLE_RATE as i32,
                    AUDIO_CHANNELS as i32,
                );
                let media = Arc::clone(self);
                let task_sid = sid.clone();
                let handle = tokio::spawn(async move {
                    tracing::info!("audio playout stream started for {task_sid}");
                    while let Some(frame) = stream.next().await {
                        if let Some(sink) = media.audio_sink() {
                            sink.on_audio(
                                &task_sid,
                                PcmFrame {
                                    samples: frame.data.to_vec(),
                                    sample_rate: frame.sample_rate,
                                    channels: frame.num_channels,
                                },
                            );
                        }
                    }
                    tracing::info!("audio playout stream ended for {task_sid}");
                });
                if let Some(previous) = self.lock_audio_streams().insert(sid, handle) {
                    previous.abort();
                }
            }
            RemoteTrack::Video(_) => {
                self.video_tracks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(sid, track);
            }
        }
    }

    fn track_unsubscribed(&self, sid: &str) {
        if let Some(handle) = self.lock_audio_streams().remove(sid) {
            handle.abort();
        }
        self.video_tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sid);
        self.stop_renderer(sid);
    }

    fn start_renderer(&self, sid: &str, sink: Arc<dyn VideoSink>) -> Result<(), CallError> {
        let track = self
            .video_tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sid)
            .cloned();
        let Some(RemoteTrack::Video(video_track)) = track else {
            return Err(CallError::ControlCommandFailed(format!("no subscribed video track {sid}")));
        };

        let mut stream = NativeVideoStream::new(video_track.rtc_track());
        let task_sid = sid.to_string();
        let handle = tokio::spawn(async move {
            tracing::info!("video renderer started for {task_sid}");
            while let Some(frame) = stream.next().await {
                let buffer = &frame.buffer;
                let (width, height) = (buffer.width(), buffer.height());
                let i420 = buffer.to_i420();
                let (y, u, v) = i420.data();
                let (stride_y, stride_u, stride_v) = i420.strides();
                sink.on_frame(I420Frame::from_strided(
                    width,
                    height,
                    [(y, stride_y), (u, stride_u), (v, stride_v)],
                ));
            }
            tracing::info!("video stream ended for {task_sid}");
        });
        if let Some(previous) = self
            .renderers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sid.to_string(), handle)
        {
            previous.abort();
        }
        Ok(())
    }

    fn stop_renderer(&self, sid: &str) {
        let handle = self
            .renderers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sid);
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("video renderer stopped for {sid}");
        }
    }

    fn stop_all(&self) {
        for (_, handle) in self.lock_audio_streams().drain() {
            handle.abort();
        }
        for (_, handle) in self.renderers.lock().unwrap_or_else(PoisonError::into_inner).drain() {
            handle.abort();
        }
        self.video_tracks.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn lock_audio_streams(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.audio_streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Local media controls bound to one LiveKit room.
pub struct LiveKitControls {
    room: Mutex<Option<Arc<Room>>>,
    media: Arc<RemoteMedia>,
    audio_source: Mutex<Option<NativeAudioSource>>,
    video_source: Mutex<Option<NativeVideoSource>>,
}

impl LiveKitControls {
    fn new(room: Arc<Room>, media: Arc<RemoteMedia>) -> Self {
        Self {
            room: Mutex::new(Some(room)),
            media,
            audio_source: Mutex::new(None),
            video_source: Mutex::new(None),
        }
    }

    async fn connected_room(&self) -> Result<Arc<Room>, CallError> {
        self.room
            .lock()
            .await
            .clone()
            .ok_or_else(|| CallError::ControlCommandFailed("not connected".into()))
    }

    /// Mute or unmute the existing publication for `source`.
    /// Returns false when nothing is published yet.
    fn set_publication_muted(room: &Room, source: LkTrackSource, muted: bool) -> bool {
        let local = room.local_participant();
        for (_, publication) in local.track_publications() {
            if publication.source() == source {
                if muted {
                    publication.mute();
                } else {
                    publication.unmute();
                }
                return true;
            }
        }
        false
    }

    async fn publish_microphone(&self, room: &Room) -> Result<(), CallError> {
        let source = NativeAudioSource::new(
            AudioSourceOptions {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            },
            AUDIO_SAMPLE_RATE,
            AUDIO_CHANNELS,
            AUDIO_QUEUE_SIZE_MS,
        );
        let track = LocalAudioTrack::create_audio_track("microphone", RtcAudioSource::Native(source.clone()));

        room.local_participant()
            .publish_track(
                LocalTrack::Audio(track),
                TrackPublishOptions {
                    source: LkTrackSource::Microphone,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| CallError::ControlCommandFailed(format!("publish audio: {e}")))?;

        *self.audio_source.lock().await = Some(source);
        tracing::info!("microphone track published");
        Ok(())
    }

    async fn publish_camera(&self, room: &Room) -> Result<(), CallError> {
        let source = NativeVideoSource::new(
            VideoResolution {
                width: VIDEO_WIDTH,
                height: VIDEO_HEIGHT,
            },
            false,
        );
        let track = LocalVideoTrack::create_video_track("camera", RtcVideoSource::Native(source.clone()));

        room.local_participant()
            .publish_track(
                LocalTrack::Video(track),
                TrackPublishOptions {
                    source: LkTrackSource::Camera,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| CallError::ControlCommandFailed(format!("publish video: {e}")))?;

        *self.video_source.lock().await = Some(source);
        tracing::info!("camera track published");
        Ok(())
    }
}

#[async_trait]
impl TransportControls for LiveKitControls {
    async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let room = self.connected_room().await?;
        if !Self::set_publication_muted(&room, LkTrackSource::Microphone, !enabled) && enabled {
            self.publish_microphone(&room).await?;
        }
        tracing::info!("microphone enabled: {enabled}");
        Ok(())
    }

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let room = self.connected_room().await?;
        if !Self::set_publication_muted(&room, LkTrackSource::Camera, !enabled) && enabled {
            self.publish_camera(&room).await?;
        }
        tracing::info!("camera enabled: {enabled}");
        Ok(())
    }

    async fn capture_audio(&self, frame: &PcmFrame) -> Result<(), CallError> {
        frame.validate()?;
        let Some(source) = self.audio_source.lock().await.clone() else {
            return Err(CallError::ControlCommandFailed("microphone not published".into()));
        };
        let frame = AudioFrame {
            data: frame.samples.as_slice().into(),
            sample_rate: frame.sample_rate,
            num_channels: frame.channels,
            samples_per_channel: frame.samples_per_channel(),
        };
        source
            .capture_frame(&frame)
            .await
            .map_err(|e| CallError::ControlCommandFailed(format!("capture audio: {e}")))
    }

    async fn capture_video(&self, frame: &I420Frame) -> Result<(), CallError> {
        frame.validate()?;
        let Some(source) = self.video_source.lock().await.clone() else {
            return Err(CallError::ControlCommandFailed("camera not published".into()));
        };

        let (chroma_w, chroma_h) = I420Frame::chroma_size(frame.width, frame.height);
        let mut buffer = I420Buffer::new(frame.width, frame.height);
        let (stride_y, stride_u, stride_v) = buffer.strides();
        let (y_dst, u_dst, v_dst) = buffer.data_mut();
        copy_plane(&frame.y, frame.width, frame.height, y_dst, stride_y);
        copy_plane(&frame.u, chroma_w, chroma_h, u_dst, stride_u);
        copy_plane(&frame.v, chroma_w, chroma_h, v_dst, stride_v);

        source.capture_frame(&VideoFrame {
            rotation: VideoRotation::VideoRotation0,
            timestamp_us: 0,
            buffer,
        });
        Ok(())
    }

    async fn attach_video_sink(&self, publication_sid: &str, sink: Arc<dyn VideoSink>) -> Result<(), CallError> {
        self.media.start_renderer(publication_sid, sink)
    }

    async fn detach_video_sink(&self, publication_sid: &str) {
        self.media.stop_renderer(publication_sid);
    }

    async fn set_audio_sink(&self, sink: Option<Arc<dyn AudioSink>>) {
        self.media.set_audio_sink(sink);
    }

    async fn disconnect(&self) {
        self.media.stop_all();
        let room = self.room.lock().await.take();
        if let Some(room) = room {
            if let Err(e) = room.close().await {
                tracing::warn!("error closing room: {e}");
            }
        }
        self.audio_source.lock().await.take();
        self.video_source.lock().await.take();
    }
}

/// Copy a packed plane into a strided destination.
fn copy_plane(src: &[u8], width: u32, rows: u32, dst: &mut [u8], dst_stride: u32) {
    let width = width as usize;
    for row in 0..rows as usize {
        let from = row * width;
        let to = row * dst_stride as usize;
        if let (Some(line), Some(out)) = (src.get(from..from + width), dst.get_mut(to..to + width)) {
            out.copy_from_slice(line);
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn map_kind(kind: LkTrackKind) -> TrackKind {
    match kind {
        LkTrackKind::Audio => TrackKind::Audio,
        LkTrackKind::Video => TrackKind::Video,
    }
}

fn remote_participant(p: &RemoteParticipant) -> Participant {
    Participant {
        identity: p.identity().to_string(),
        is_local: false,
        name: non_empty(p.name()),
        metadata: non_empty(p.metadata()),
    }
}

fn remote_publication(identity: &str, publication: &RemoteTrackPublication) -> TrackPublication {
    TrackPublication {
        sid: publication.sid().to_string(),
        participant_identity: identity.to_string(),
        kind: map_kind(publication.kind()),
        subscribed: publication.is_subscribed(),
        muted: publication.is_muted(),
        has_track: publication.track().is_some(),
    }
}

fn snapshot_room(room: &Room, media: &Arc<RemoteMedia>) -> TransportSnapshot {
    let local = room.local_participant();
    let mut snapshot = TransportSnapshot {
        local: Some(Participant {
            identity: local.identity().to_string(),
            is_local: true,
            name: non_empty(local.name()),
            metadata: non_empty(local.metadata()),
        }),
        ..Default::default()
    };

    for (_, participant) in room.remote_participants() {
        let info = remote_participant(&participant);
        for (_, publication) in participant.track_publications() {
            if let Some(track) = publication.track() {
                media.track_subscribed(publication.sid().to_string(), track);
            }
            snapshot
                .publications
                .push(remote_publication(&info.identity, &publication));
        }
        snapshot.participants.push(info);
    }
    snapshot
}

/// Publication payload for mute events; `None` for the local participant,
/// whose state is owned by the control surface.
fn muted_publication(participant: &LkParticipant, publication: &LkTrackPublication) -> Option<TrackPublication> {
    let (LkParticipant::Remote(participant), LkTrackPublication::Remote(publication)) = (participant, publication)
    else {
        return None;
    };
    Some(remote_publication(&participant.identity().to_string(), publication))
}

fn map_room_event(event: RoomEvent) -> Option<TransportEvent> {
    let mapped = match event {
        RoomEvent::ParticipantConnected(participant) => {
            TransportEvent::ParticipantConnected(remote_participant(&participant))
        }

        RoomEvent::ParticipantDisconnected(participant) => TransportEvent::ParticipantDisconnected {
            identity: participant.identity().to_string(),
        },

        RoomEvent::TrackSubscribed { publication, participant, .. } => {
            let mut info = remote_publication(&participant.identity().to_string(), &publication);
            info.subscribed = true;
            info.has_track = true;
            TransportEvent::TrackSubscribed(info)
        }

        RoomEvent::TrackUnsubscribed { publication, participant, .. } => TransportEvent::TrackUnsubscribed {
            sid: publication.sid().to_string(),
            participant_identity: participant.identity().to_string(),
            kind: map_kind(publication.kind()),
        },

        RoomEvent::TrackMuted { participant, publication } => {
            let mut info = muted_publication(&participant, &publication)?;
            info.muted = true;
            TransportEvent::TrackMuted(info)
        }

        RoomEvent::TrackUnmuted { participant, publication } => {
            let mut info = muted_publication(&participant, &publication)?;
            info.muted = false;
            TransportEvent::TrackUnmuted(info)
        }

        RoomEvent::LocalTrackPublished { publication, .. } => TransportEvent::LocalTrackPublished {
            sid: publication.sid().to_string(),
            kind: map_kind(publication.kind()),
        },

        RoomEvent::LocalTrackUnpublished { publication, .. } => TransportEvent::LocalTrackUnpublished {
            sid: publication.sid().to_string(),
            kind: map_kind(publication.kind()),
        },

        RoomEvent::Disconnected { reason } => TransportEvent::Disconnected {
            reason: Some(format!("{reason:?}")),
        },

        other => {
            tracing::debug!("unhandled room event: {other:?}");
            return None;
        }
    };
    Some(mapped)
}

/// Start or stop pulling decoded media for subscription changes.
fn track_media(event: &RoomEvent, media: &Arc<RemoteMedia>) {
    match event {
        RoomEvent::TrackSubscribed { track, publication, .. } => {
            media.track_subscribed(publication.sid().to_string(), track.clone());
        }
        RoomEvent::TrackUnsubscribed { publication, .. } => {
            media.track_unsubscribed(&publication.sid().to_string());
        }
        _ => {}
    }
}

async fn forward_events(
    mut room_events: mpsc::UnboundedReceiver<RoomEvent>,
    tx: mpsc::UnboundedSender<TransportEvent>,
    media: Arc<RemoteMedia>,
) {
    while let Some(event) = room_events.recv().await {
        track_media(&event, &media);
        let Some(event) = map_room_event(event) else {
            continue;
        };
        let disconnected = matches!(event, TransportEvent::Disconnected { .. });
        if tx.send(event).is_err() || disconnected {
            break;
        }
    }
    media.stop_all();
    tracing::info!("room event forwarding ended");
}
