// The Req/Resp engine: outbound requests with per-chunk timeouts and
// scoring feedback, and the inbound stream dispatcher.

pub mod client;
pub mod server;

pub use client::send_request;
pub use server::{handle_inbound_stream, InboundCtx, Responder};
