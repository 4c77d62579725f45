pub mod compare;
pub mod encoder;
pub mod frame;
pub mod pipeline;

pub use encoder::EncoderFeed;
pub use frame::{shot_filename, Frame};
pub use pipeline::{ScreenshotPipeline, DISK_DEDUP_THRESHOLD, ENCODER_REPEAT_THRESHOLD};
