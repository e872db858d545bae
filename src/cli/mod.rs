pub mod ascii_preview;
pub mod snapshot;

pub use ascii_preview::{AsciiPreview, AsciiRenderer};
pub use snapshot::SnapshotPreview;
