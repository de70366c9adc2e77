use async_trait::async_trait;

use crate::errors::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Camera,
    Microphone,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Camera => "camera",
            Capability::Microphone => "microphone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityGrant {
    pub capability: Capability,
    pub granted: bool,
}

/// Host platform collaborator that owns the OS permission prompts.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn request_capabilities(&self, capabilities: &[Capability]) -> Vec<CapabilityGrant>;
}

const CALL_CAPABILITIES: [Capability; 2] = [Capability::Camera, Capability::Microphone];

/// Ask for camera and microphone; both must be granted.
///
/// A capability the platform does not answer for counts as denied.
pub async fn request_call_permissions(platform: &dyn Platform) -> Result<(), CallError> {
    let grants = platform.request_capabilities(&CALL_CAPABILITIES).await;

    let missing: Vec<&str> = CALL_CAPABILITIES
        .iter()
        .filter(|cap| !grants.iter().any(|g| g.capability == **cap && g.granted))
        .map(|cap| cap.as_str())
        .collect();

    if missing.is_empty() {
        tracing::debug!("call permissions granted");
        Ok(())
    } else {
        tracing::info!("call permissions denied: {}", missing.join(", "));
        Err(CallError::PermissionDenied(format!("missing {}", missing.join(", "))))
    }
}
