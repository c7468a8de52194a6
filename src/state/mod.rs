//! Process-wide state shared by every stream a client starts.
mod stream_id;

pub use stream_id::StreamIdGenerator;
