//! faceguard-core: descriptor matching and overlay geometry.
//!
//! Pure building blocks for the live recognition loop: validated face
//! descriptors, the nearest-neighbour matcher, detector tuning helpers,
//! overlay drawing and frame-rate throttling. No I/O.

pub mod canvas;
pub mod descriptor;
pub mod geometry;
pub mod matcher;
pub mod throttle;
pub mod types;

pub use canvas::{Canvas, Color, ImageCanvas};
pub use descriptor::{is_valid_descriptor, Descriptor, DescriptorError, DESCRIPTOR_DIM};
pub use geometry::{adjusted_threshold, attribute_lines, draw_attributes, draw_box, format_file_size, optimal_input_size, resize_canvas, BoxStyle};
pub use matcher::FaceMatcher;
pub use throttle::Throttle;
pub use types::{Detection, FaceAttributes, FaceBox, Identity, MatchLabel, MatchResult, StorageData, STORAGE_VERSION};
