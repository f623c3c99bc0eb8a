//! Host/worker RPC
//!
//! Lets a lightweight [`client::EngineClient`] drive an [`crate::inference::engine::Engine`]
//! that runs elsewhere (another task, thread, or process). Requests carry a
//! correlation id; replies, stream chunks and errors refer back to it.

pub mod client;
pub mod handler;
pub mod protocol;
pub mod transport;

pub use client::EngineClient;
pub use handler::serve;
pub use protocol::{EngineRequest, RequestId, ResponsePayload, WorkerMessage};
pub use transport::{channel_pair, json_lines, MessageSink, MessageSource};
