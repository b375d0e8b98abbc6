pub mod encoder;
pub mod ffmpeg_manager;
pub mod processor;
pub mod source;
pub mod transform;

pub use encoder::*;
pub use ffmpeg_manager::*;
pub use processor::*;
pub use source::*;
pub use transform::*;
