//! External fetch tools: metadata probe, download and playlist merge.

pub mod download;
pub mod merge;
pub mod probe;

pub use download::{run_download, OutputPattern};
pub use merge::merge_segments;
pub use probe::{fetch_metadata, FormatSummary, ProbeInfo};
