// Wire helpers for lotto-wire framing over tokio streams.
pub use self::frame_io::{read_frame, read_reply, write_frame, write_request};

mod frame_io;
