use crate::events::LocalControlState;
use crate::names::NameContext;
use crate::reconciler::CallState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileVideo {
    /// Render frames from this publication.
    Live { publication_sid: String },
    /// Show the name and a "no video" indicator.
    NoVideo,
}

/// One participant's cell in the call grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub participant_identity: String,
    pub label: String,
    pub is_local: bool,
    pub audio_muted: bool,
    pub video: TileVideo,
}

/// Partition participants into live and placeholder tiles.
///
/// The local participant comes first and is driven by the local video handle
/// and control flags, never by remote publications. Each participant yields
/// exactly one tile.
pub fn render_tiles(state: &CallState, names: &NameContext<'_>, controls: LocalControlState) -> Vec<Tile> {
    let mut tiles = Vec::with_capacity(state.roster().remote_count() + 1);

    if let Some(local) = state.local() {
        let video = match state.local_video() {
            Some(sid) if !controls.camera_muted => TileVideo::Live {
                publication_sid: sid.to_string(),
            },
            _ => TileVideo::NoVideo,
        };
        tiles.push(Tile {
            participant_identity: local.identity.clone(),
            label: names.resolve_participant(local),
            is_local: true,
            audio_muted: controls.mic_muted,
            video,
        });
    }

    for participant in state.roster().remotes() {
        let video = match state.live_video(&participant.identity) {
            Some(publication) => TileVideo::Live {
                publication_sid: publication.sid.clone(),
            },
            None => TileVideo::NoVideo,
        };
        tiles.push(Tile {
            participant_identity: participant.identity.clone(),
            label: names.resolve_participant(participant),
            is_local: false,
            audio_muted: state.audio_muted(&participant.identity),
            video,
        });
    }

    tiles
}
