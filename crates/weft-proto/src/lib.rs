//! Wire protocol for the weft fabric.
//!
//! Three contracts live here:
//!
//! 1. the JSON-RPC 2.0 envelope spoken to the generation runtime, one
//!    message per line ([`rpc`], [`codec`]);
//! 2. the typed method catalogue of that runtime ([`methods`]) and its
//!    streaming notifications ([`notify`]);
//! 3. the bus subjects and payload schemas exchanged between controller
//!    and workers ([`bus`]).

pub mod bus;
pub mod codec;
pub mod methods;
pub mod notify;
pub mod rpc;

pub use codec::{FrameBuffer, encode_frame};
pub use rpc::{IncomingMessage, RpcErrorObject, RpcNotification, RpcRequest, RpcResponse};
