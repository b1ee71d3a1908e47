//! faceguard: live face recognition against a local identity gallery.
//!
//! Wires a camera stream and a face engine into a throttled detection loop,
//! persists enrolled identities, and exposes the host-facing controls.

pub mod config;
pub mod engine;
pub mod events;
pub mod guard;
pub mod shell;
pub mod store;

pub use config::{ConfigError, GuardConfig};
pub use engine::{spawn_engine, DetectOptions, EngineError, EngineHandle, FaceEngine};
pub use events::{GuardEvent, StatusKind, StatusLine};
pub use guard::{FaceGuard, GuardError, GuardState, SharedCanvas};
pub use shell::{ControlState, HostShell, ShellError, UserChip};
pub use store::{BackendKind, IdentityStore, StoreConfig, StoreError};
