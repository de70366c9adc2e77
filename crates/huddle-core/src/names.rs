//! Human-readable labels for opaque participant identities.
//!
//! Resolution walks a fixed fallback chain and never fails: malformed
//! metadata just falls through to the next rule.

use crate::backend::CallMetadata;
use crate::events::Participant;

/// Names transports and older clients use when the user set none.
const DEFAULT_NAME_SENTINELS: &[&str] = &["unknown", "anonymous", "participant", "guest"];

/// Number of identity characters shown in a placeholder label.
const PLACEHOLDER_PREFIX_LEN: usize = 6;

const METADATA_NAME_KEYS: &[&str] = &["displayName", "display_name", "name"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub you: String,
    pub guest: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            you: "You".to_string(),
            guest: "Guest".to_string(),
        }
    }
}

impl Labels {
    /// Label set for a BCP 47 language tag. Unknown languages get English.
    pub fn for_language(language: Option<&str>) -> Self {
        let primary = language
            .and_then(|tag| tag.split(['-', '_']).next())
            .map(str::to_ascii_lowercase);
        match primary.as_deref() {
            Some("fr") => Self {
                you: "Vous".to_string(),
                guest: "Invité".to_string(),
            },
            _ => Self::default(),
        }
    }
}

/// Everything name resolution needs besides the participant itself.
#[derive(Debug, Clone, Copy)]
pub struct NameContext<'a> {
    pub current_user_id: Option<&'a str>,
    pub call: &'a CallMetadata,
    pub labels: &'a Labels,
}

impl NameContext<'_> {
    pub fn resolve_participant(&self, participant: &Participant) -> String {
        self.resolve(
            &participant.identity,
            participant.metadata.as_deref(),
            participant.name.as_deref(),
        )
    }

    /// First match wins:
    /// the current user, a call member, a metadata name, a provided name,
    /// then a placeholder derived from the identity.
    pub fn resolve(&self, identity: &str, metadata: Option<&str>, provided_name: Option<&str>) -> String {
        if self.current_user_id == Some(identity) {
            return self.labels.you.clone();
        }

        if let Some(name) = self.call.member(identity).and_then(|u| u.full_name()) {
            return name;
        }

        if let Some(name) = metadata.and_then(name_from_metadata) {
            return name;
        }

        if let Some(name) = provided_name.map(str::trim) {
            if !name.is_empty() && name != identity && !is_sentinel(name) {
                return name.to_string();
            }
        }

        placeholder(identity, self.labels)
    }
}

fn is_sentinel(name: &str) -> bool {
    DEFAULT_NAME_SENTINELS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(name.trim()))
}

fn name_from_metadata(blob: &str) -> Option<String> {
    let json = match serde_json::from_str::<serde_json::Value>(blob) {
        Ok(json) => json,
        Err(e) => {
            tracing::debug!("participant metadata is not JSON: {e}");
            return None;
        }
    };
    METADATA_NAME_KEYS
        .iter()
        .filter_map(|key| json.get(*key).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|name| !name.is_empty() && !is_sentinel(name))
        .map(str::to_string)
}

fn placeholder(identity: &str, labels: &Labels) -> String {
    let prefix: String = identity.chars().take(PLACEHOLDER_PREFIX_LEN).collect();
    if prefix.is_empty() {
        labels.guest.clone()
    } else {
        format!("{} {prefix}", labels.guest)
    }
}
