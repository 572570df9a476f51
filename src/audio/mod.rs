//! Audio stitching for chunked synthesis

pub mod stitch;

pub use stitch::{AudioStitcher, FadeCurve};
