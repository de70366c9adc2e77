//! Canonical call state and the reducer that folds transport events into it.
//!
//! Every transition is a pure function of the previous state and one event,
//! so the whole table can be exercised without a live transport.

use crate::events::{
    ConnectionState, Participant, TrackKind, TrackPublication, TransportEvent, TransportSnapshot,
};
use crate::participants::ParticipantRoster;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallState {
    connection: ConnectionState,
    roster: ParticipantRoster,
    publications: Vec<TrackPublication>,
    local_video: Option<String>,
}

impl CallState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn with_connection(mut self, connection: ConnectionState) -> Self {
        self.connection = connection;
        self
    }

    pub fn roster(&self) -> &ParticipantRoster {
        &self.roster
    }

    pub fn local(&self) -> Option<&Participant> {
        self.roster.local()
    }

    pub fn publications(&self) -> &[TrackPublication] {
        &self.publications
    }

    pub fn publication(&self, sid: &str) -> Option<&TrackPublication> {
        self.publications.iter().find(|p| p.sid == sid)
    }

    pub fn local_video(&self) -> Option<&str> {
        self.local_video.as_deref()
    }

    /// The newest eligible video publication owned by `identity`.
    pub fn live_video(&self, identity: &str) -> Option<&TrackPublication> {
        self.publications
            .iter()
            .rev()
            .find(|p| p.participant_identity == identity && p.kind == TrackKind::Video && p.is_eligible())
    }

    /// At most one publication per remote participant, in roster order.
    pub fn visible_video(&self) -> Vec<&TrackPublication> {
        self.roster
            .remotes()
            .iter()
            .filter_map(|p| self.live_video(&p.identity))
            .collect()
    }

    /// Whether the participant's newest subscribed microphone is muted.
    pub fn audio_muted(&self, identity: &str) -> bool {
        self.publications
            .iter()
            .rev()
            .find(|p| p.participant_identity == identity && p.kind == TrackKind::Audio && p.subscribed)
            .is_some_and(|p| p.muted)
    }

    fn find_mut(&mut self, sid: &str) -> Option<&mut TrackPublication> {
        self.publications.iter_mut().find(|p| p.sid == sid)
    }

    fn insert_if_absent(&mut self, publication: TrackPublication) -> bool {
        if self.publications.iter().any(|p| p.sid == publication.sid) {
            return false;
        }
        self.publications.push(publication);
        true
    }
}

/// Seed state with what the transport already knew at connect time.
///
/// Must run before any streamed event; entities it adds are skipped by the
/// add-if-absent rules of [`apply`].
pub fn apply_snapshot(mut state: CallState, snapshot: &TransportSnapshot) -> CallState {
    if let Some(local) = &snapshot.local {
        state.roster.set_local(local.clone());
    }
    for participant in &snapshot.participants {
        state.roster.add_if_absent(participant.clone());
    }
    for publication in &snapshot.publications {
        if state.roster.contains(&publication.participant_identity) {
            state.insert_if_absent(publication.clone());
        } else {
            tracing::debug!(
                "snapshot publication {} references unknown participant {}",
                publication.sid,
                publication.participant_identity
            );
        }
    }
    state
}

/// Fold one transport event into the state. Never fails: events that
/// reference unknown participants or handles leave the state untouched.
pub fn apply(mut state: CallState, event: &TransportEvent) -> CallState {
    match event {
        TransportEvent::ParticipantConnected(participant) => {
            if participant.is_local {
                tracing::debug!("ignoring connect for local participant {}", participant.identity);
            } else {
                state.roster.add_if_absent(participant.clone());
            }
        }

        TransportEvent::ParticipantDisconnected { identity } => {
            state.roster.remove(identity);
            state.publications.retain(|p| &p.participant_identity != identity);
        }

        TransportEvent::TrackSubscribed(publication) => {
            if !state.roster.contains(&publication.participant_identity) {
                tracing::debug!(
                    "track {} subscribed for unknown participant {}",
                    publication.sid,
                    publication.participant_identity
                );
                return state;
            }
            match state.find_mut(&publication.sid) {
                Some(existing) => {
                    existing.subscribed = true;
                    existing.has_track |= publication.has_track;
                }
                None => {
                    state.publications.push(TrackPublication {
                        subscribed: true,
                        ..publication.clone()
                    });
                }
            }
        }

        TransportEvent::TrackUnsubscribed { sid, .. } => {
            state.publications.retain(|p| &p.sid != sid);
        }

        TransportEvent::TrackMuted(publication) => {
            if state.roster.is_local(&publication.participant_identity) {
                return state;
            }
            match state.find_mut(&publication.sid) {
                Some(existing) => existing.muted = true,
                None => tracing::debug!("mute for unknown track {}", publication.sid),
            }
        }

        TransportEvent::TrackUnmuted(publication) => {
            if state.roster.is_local(&publication.participant_identity) {
                return state;
            }
            match state.find_mut(&publication.sid) {
                Some(existing) => existing.muted = false,
                None => {
                    let readmit = state.roster.contains(&publication.participant_identity)
                        && publication.subscribed
                        && publication.has_track;
                    if readmit {
                        state.insert_if_absent(TrackPublication {
                            muted: false,
                            ..publication.clone()
                        });
                    } else {
                        tracing::debug!("unmute for unknown track {}", publication.sid);
                    }
                }
            }
        }

        TransportEvent::LocalTrackPublished { sid, kind } => {
            if *kind == TrackKind::Video {
                state.local_video = Some(sid.clone());
            }
        }

        TransportEvent::LocalTrackUnpublished { sid, kind } => {
            if *kind == TrackKind::Video && state.local_video.as_deref() == Some(sid.as_str()) {
                state.local_video = None;
            }
        }

        TransportEvent::Disconnected { reason } => {
            tracing::info!("transport disconnected: {reason:?}");
            return CallState::new().with_connection(ConnectionState::Disconnected);
        }
    }
    state
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn video(sid: &str, owner: &str) -> TrackPublication {
        TrackPublication {
            sid: sid.to_string(),
            participant_identity: owner.to_string(),
            kind: TrackKind::Video,
            subscribed: true,
            muted: false,
            has_track: true,
        }
    }

    pub(crate) fn audio(sid: &str, owner: &str) -> TrackPublication {
        TrackPublication {
            kind: TrackKind::Audio,
            ..video(sid, owner)
        }
    }

    fn joined(remotes: &[&str]) -> CallState {
        let snapshot = TransportSnapshot {
            local: Some(Participant::local("me")),
            participants: remotes.iter().map(|id| Participant::remote(*id)).collect(),
            publications: Vec::new(),
        };
        apply_snapshot(CallState::new(), &snapshot)
    }

    fn fold(state: CallState, events: &[TransportEvent]) -> CallState {
        events.iter().fold(state, apply)
    }

    fn visible_sids(state: &CallState) -> Vec<String> {
        state.visible_video().iter().map(|p| p.sid.clone()).collect()
    }

    #[test]
    fn participant_connected_is_idempotent() {
        let state = fold(
            joined(&[]),
            &[
                TransportEvent::ParticipantConnected(Participant::remote("bob")),
                TransportEvent::ParticipantConnected(Participant::remote("bob")),
            ],
        );
        assert_eq!(state.roster().remote_count(), 1);
    }

    #[test]
    fn participant_disconnected_drops_owned_publications() {
        let state = fold(
            joined(&["bob", "carol"]),
            &[
                TransportEvent::TrackSubscribed(video("TR_b", "bob")),
                TransportEvent::TrackSubscribed(audio("TR_ba", "bob")),
                TransportEvent::TrackSubscribed(video("TR_c", "carol")),
                TransportEvent::ParticipantDisconnected { identity: "bob".into() },
            ],
        );
        assert!(!state.roster().contains("bob"));
        assert_eq!(state.publications().len(), 1);
        assert_eq!(state.publications()[0].sid, "TR_c");
    }

    #[test]
    fn repeated_subscribe_and_unsubscribe_never_duplicates() {
        let sub = TransportEvent::TrackSubscribed(video("TR_1", "bob"));
        let unsub = TransportEvent::TrackUnsubscribed {
            sid: "TR_1".into(),
            participant_identity: "bob".into(),
            kind: TrackKind::Video,
        };
        let mut state = joined(&["bob"]);
        for event in [&sub, &sub, &unsub, &sub, &sub, &unsub, &unsub, &sub] {
            state = apply(state, event);
            assert!(state.publications().iter().filter(|p| p.sid == "TR_1").count() <= 1);
            assert!(visible_sids(&state).len() <= 1);
        }
        assert_eq!(visible_sids(&state), vec!["TR_1"]);
    }

    #[test]
    fn subscribe_for_unknown_participant_is_ignored() {
        let state = apply(joined(&[]), &TransportEvent::TrackSubscribed(video("TR_1", "ghost")));
        assert!(state.publications().is_empty());
    }

    #[test]
    fn muted_track_leaves_visible_set() {
        let state = fold(
            joined(&["bob"]),
            &[
                TransportEvent::TrackSubscribed(video("TR_1", "bob")),
                TransportEvent::TrackMuted(video("TR_1", "bob")),
            ],
        );
        assert!(state.publication("TR_1").unwrap().subscribed);
        assert!(visible_sids(&state).is_empty());
    }

    #[test]
    fn subscribe_mute_unmute_converges_despite_interleaving() {
        let state = fold(
            joined(&["bob", "carol"]),
            &[
                TransportEvent::TrackSubscribed(video("TR_b", "bob")),
                TransportEvent::TrackSubscribed(video("TR_c", "carol")),
                TransportEvent::TrackMuted(video("TR_b", "bob")),
                TransportEvent::TrackMuted(video("TR_c", "carol")),
                TransportEvent::TrackUnmuted(video("TR_b", "bob")),
                TransportEvent::ParticipantDisconnected { identity: "carol".into() },
            ],
        );
        assert_eq!(visible_sids(&state), vec!["TR_b"]);
    }

    #[test]
    fn unmute_readmits_missing_publication_once() {
        let state = fold(
            joined(&["bob"]),
            &[
                TransportEvent::TrackUnmuted(video("TR_1", "bob")),
                TransportEvent::TrackUnmuted(video("TR_1", "bob")),
            ],
        );
        assert_eq!(state.publications().len(), 1);
        assert_eq!(visible_sids(&state), vec!["TR_1"]);
    }

    #[test]
    fn mute_events_for_local_participant_are_ignored() {
        let publication = video("TR_me", "me");
        let state = fold(
            joined(&[]),
            &[
                TransportEvent::TrackMuted(publication.clone()),
                TransportEvent::TrackUnmuted(publication),
            ],
        );
        assert!(state.publications().is_empty());
    }

    #[test]
    fn republish_replaces_old_handle() {
        let mut fresh = video("TR_new", "bob");
        fresh.muted = true;
        let state = fold(
            joined(&["bob"]),
            &[
                TransportEvent::TrackSubscribed(video("TR_old", "bob")),
                TransportEvent::TrackMuted(video("TR_old", "bob")),
                TransportEvent::TrackUnsubscribed {
                    sid: "TR_old".into(),
                    participant_identity: "bob".into(),
                    kind: TrackKind::Video,
                },
                TransportEvent::TrackSubscribed(fresh),
                TransportEvent::TrackUnmuted(video("TR_new", "bob")),
            ],
        );
        assert!(state.publication("TR_old").is_none());
        assert_eq!(state.live_video("bob").map(|p| p.sid.as_str()), Some("TR_new"));
    }

    #[test]
    fn participant_contributes_only_latest_eligible_video() {
        let state = fold(
            joined(&["bob"]),
            &[
                TransportEvent::TrackSubscribed(video("TR_1", "bob")),
                TransportEvent::TrackSubscribed(video("TR_2", "bob")),
            ],
        );
        assert_eq!(visible_sids(&state), vec!["TR_2"]);
    }

    #[test]
    fn local_video_handle_follows_publish_events() {
        let published = TransportEvent::LocalTrackPublished {
            sid: "TR_cam".into(),
            kind: TrackKind::Video,
        };
        let state = apply(joined(&[]), &published);
        assert_eq!(state.local_video(), Some("TR_cam"));

        let stale = TransportEvent::LocalTrackUnpublished {
            sid: "TR_older".into(),
            kind: TrackKind::Video,
        };
        let state = apply(state, &stale);
        assert_eq!(state.local_video(), Some("TR_cam"));

        let state = apply(
            state,
            &TransportEvent::LocalTrackUnpublished {
                sid: "TR_cam".into(),
                kind: TrackKind::Video,
            },
        );
        assert_eq!(state.local_video(), None);
    }

    #[test]
    fn disconnect_clears_everything() {
        let state = fold(
            joined(&["bob"]),
            &[
                TransportEvent::TrackSubscribed(video("TR_1", "bob")),
                TransportEvent::LocalTrackPublished {
                    sid: "TR_cam".into(),
                    kind: TrackKind::Video,
                },
                TransportEvent::Disconnected { reason: None },
            ],
        );
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert!(state.publications().is_empty());
        assert!(state.local().is_none());
        assert_eq!(state.roster().remote_count(), 0);
        assert_eq!(state.local_video(), None);
    }

    #[test]
    fn snapshot_entities_are_not_duplicated_by_later_events() {
        let snapshot = TransportSnapshot {
            local: Some(Participant::local("me")),
            participants: vec![Participant::remote("bob")],
            publications: vec![video("TR_b", "bob")],
        };
        let state = fold(
            apply_snapshot(CallState::new(), &snapshot),
            &[
                TransportEvent::ParticipantConnected(Participant::remote("bob")),
                TransportEvent::TrackSubscribed(video("TR_b", "bob")),
            ],
        );
        assert_eq!(state.roster().remote_count(), 1);
        assert_eq!(state.publications().len(), 1);
    }

    #[test]
    fn audio_mute_flag_tracks_latest_microphone() {
        let state = fold(
            joined(&["bob"]),
            &[
                TransportEvent::TrackSubscribed(audio("TR_a", "bob")),
                TransportEvent::TrackMuted(audio("TR_a", "bob")),
            ],
        );
        assert!(state.audio_muted("bob"));
        let state = apply(state, &TransportEvent::TrackUnmuted(audio("TR_a", "bob")));
        assert!(!state.audio_muted("bob"));
        assert!(state.visible_video().is_empty());
    }
}
