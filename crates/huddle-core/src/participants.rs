use crate::events::Participant;

/// Remote participants in join order, plus the local participant.
///
/// Never holds two entries with the same identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantRoster {
    local: Option<Participant>,
    remotes: Vec<Participant>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local(&mut self, participant: Participant) {
        self.remotes.retain(|p| p.identity != participant.identity);
        self.local = Some(Participant {
            is_local: true,
            ..participant
        });
    }

    pub fn local(&self) -> Option<&Participant> {
        self.local.as_ref()
    }

    pub fn is_local(&self, identity: &str) -> bool {
        self.local.as_ref().is_some_and(|p| p.identity == identity)
    }

    /// Add a remote participant unless one with the same identity is present.
    /// Returns whether the roster changed.
    pub fn add_if_absent(&mut self, participant: Participant) -> bool {
        if self.is_local(&participant.identity) || self.contains(&participant.identity) {
            return false;
        }
        self.remotes.push(Participant {
            is_local: false,
            ..participant
        });
        true
    }

    pub fn remove(&mut self, identity: &str) -> bool {
        let before = self.remotes.len();
        self.remotes.retain(|p| p.identity != identity);
        self.remotes.len() != before
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.remotes.iter().any(|p| p.identity == identity)
    }

    pub fn remotes(&self) -> &[Participant] {
        &self.remotes
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }
}
