//! Notifications published by the live component.

use faceguard_core::FaceBox;

/// Default capacity of the event channel. Slow subscribers lag rather than
/// block the detection loop.
pub const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum GuardEvent {
    /// A face matched an enrolled identity.
    Recognized {
        label: String,
        distance: f32,
        bbox: FaceBox,
    },
    /// A face matched nothing within the threshold.
    Unknown { distance: f32, bbox: FaceBox },
    /// A descriptor was appended to `label`, which now has `count` samples.
    Enrolled { label: String, count: usize },
    Error { message: String, cause: String },
    Status { message: String, is_loading: bool },
}

/// How the host should render the status text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Loading,
    Ready,
    Error,
}

/// The single status surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub message: String,
    pub kind: StatusKind,
}

impl StatusLine {
    pub fn new(message: impl Into<String>, kind: StatusKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.kind == StatusKind::Loading
    }
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new("Initializing...", StatusKind::Loading)
    }
}
