//! Frame types, per-side I/O abstractions, and the inspector chain.
//!
//! This generalizes the teacher's `nomadflow_ws::bridge` — which pumped
//! `axum::extract::ws::Message` on one side and `tokio_tungstenite::Message`
//! on the other through a bare `tokio::select!` — into a pair of traits
//! (`FrameSource`/`FrameSink`) so the richer forwarder loop in
//! `wsbridge-proxy` can read, inspect, and write either side uniformly,
//! with independent keepalive pings layered on top.

pub mod chain;
pub mod sides;
pub mod writer;

pub use chain::{Inspector, InspectorChain};
pub use sides::{ClientSink, ClientSource, FrameEvent, FrameSink, FrameSource, UpstreamSink, UpstreamSource};
pub use writer::DirectWriter;

/// One complete WebSocket frame, as seen at the inspector boundary. Binary
/// frames are opaque to every inspector and always pass through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(s) => Some(s.as_str()),
            Frame::Binary(_) => None,
        }
    }
}

/// Which leg of the connection a frame is travelling along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Close codes this bridge ever emits itself (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub enum CloseCode {
    /// 1001 — drain or keepalive timeout.
    GoingAway,
    /// 1014 — upstream dial failed.
    BadGateway,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::GoingAway => 1001,
            CloseCode::BadGateway => 1014,
        }
    }
}
