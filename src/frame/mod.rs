//! The wire protocol: the `LenFlags` header plus the `Single`/`Batched`
//! frame bodies built on top of it.

pub mod codec;
pub mod header;

pub use codec::{encode_batch, encode_single, parse, BatchItem};
pub use header::{append_api, decode_len_flags, encode_len_flags, read_api};
