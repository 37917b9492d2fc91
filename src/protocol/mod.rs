pub mod codec;
pub mod frame;
pub mod options;
pub mod wire;

pub use codec::{FrameCodec, RequestFrame, ResponseFrame};
pub use frame::{
    encode_header, ee_head_len, request_head_len, FrameHeader, GeneralStatement, ProtocolVersion,
    StatementResult, StatementType, MAGIC_NUMBER,
};
pub use options::{OptionalRequest, RequestOption};
pub use wire::{WireReader, WireWrite};
