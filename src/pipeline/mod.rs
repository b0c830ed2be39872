pub mod buffer;
pub mod session;

pub use buffer::FrameBuffer;
pub use session::{AcquisitionSnapshot, PreviewStatus, Session, SessionEvent, SessionState};
