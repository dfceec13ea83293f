//! Engine lifecycle states.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of an [`Engine`](super::Engine).
///
/// ```text
/// Unloaded --load--> Loading --ok--> Ready --generate--> Generating --> Ready
///                       \--err--> Failed --load--> Loading
/// Ready --unload--> Unloaded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
    Generating,
    Failed,
}

impl EngineState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Failed => "failed",
        }
    }

    /// A load or generate is in flight.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Loading | Self::Generating)
    }

    /// Numeric code for the C ABI.
    pub fn code(self) -> i32 {
        match self {
            Self::Unloaded => 0,
            Self::Loading => 1,
            Self::Ready => 2,
            Self::Generating => 3,
            Self::Failed => 4,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
