pub mod frame;
pub mod text;

pub use frame::{BinaryFrame, BinaryFrameType, FRAME_VERSION};
pub use text::TextFrame;
