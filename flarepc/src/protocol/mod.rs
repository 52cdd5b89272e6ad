mod header;
pub use header::{HEADER_SIZE, Header, MAGIC, MessageCode, Status};

mod codec;
pub use codec::{DecodeError, Frame, FrameDecoder, ack_frame, encode_frame, heartbeat_frame};

mod message;
pub use message::{Request, RequestMeta, Response};
