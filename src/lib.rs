// Export modules for use in tests
pub mod atomic_store;
pub mod bookmark;
pub mod builder;
pub mod document;
pub mod encoding;
pub mod error;
pub mod layout;
pub mod page_index;
pub mod progress;
pub mod sidecar;
pub mod tags;

// Re-export the reader-facing surface
pub use builder::{BuildConfig, BuildState};
pub use document::{DocumentHandle, Geometry};
pub use encoding::Encoding;
pub use error::{ReaderError, Result};
pub use layout::{CellMetrics, FontMetrics, LayoutParams};
