//! Inference platform selection.
//!
//! The reference SDKs pick pool/image/net/preprocessor classes with
//! compile-time `#ifdef` switches. Here the platform is an explicit runtime
//! capability value carried by [`crate::context::HalContext`]; factories
//! dispatch on it and tests can construct any platform on any build.

use serde::{Deserialize, Serialize};

/// Which hardware family the HAL backends should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferencePlatform {
    /// Integrated NPU sharing the SoC video pipeline: contiguous ION/VB
    /// memory, hardware video frames, the video-scaler preprocess unit and
    /// a single-stage (batch 1) model runtime.
    Edge,
    /// Discrete accelerator: dedicated device memory, stage-compiled models
    /// with multiple batch variants, optional pre-reserved runtime memory.
    Accel,
    /// CPU model of the hardware. Every driver seam is backed by a host
    /// implementation; used for tests, CI and application bring-up.
    Host,
    /// Resolve to the platform the active context was built for.
    Automatic,
}

impl InferencePlatform {
    /// Collapse `Automatic` onto a concrete platform.
    pub fn resolve(self, context_platform: InferencePlatform) -> InferencePlatform {
        match self {
            InferencePlatform::Automatic => context_platform,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_automatic_resolves_to_context_platform() {
        let p = InferencePlatform::Automatic.resolve(InferencePlatform::Accel);
        assert_eq!(p, InferencePlatform::Accel);
        let p = InferencePlatform::Edge.resolve(InferencePlatform::Host);
        assert_eq!(p, InferencePlatform::Edge);
    }

    #[test]
    fn test_platform_serde_round_trip() {
        let json = serde_json::to_string(&InferencePlatform::Edge).unwrap();
        assert_eq!(json, "\"edge\"");
        let back: InferencePlatform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InferencePlatform::Edge);
    }
}
