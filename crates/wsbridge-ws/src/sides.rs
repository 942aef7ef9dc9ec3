//! Uniform per-side frame I/O over axum's client-facing `WebSocket` and
//! tokio-tungstenite's upstream `WebSocketStream`, so the forwarder loop in
//! `wsbridge-proxy` can be written once and run on both directions.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::Frame;

/// What the forwarder loop's single read call can observe. Control frames
/// (ping/pong/close) never reach the inspector chain — only `Data` does.
#[derive(Debug)]
pub enum FrameEvent {
    Data(Frame),
    Pong(Vec<u8>),
    Closed,
}

#[async_trait]
pub trait FrameSource: Send {
    /// Await the next frame. `Ok(FrameEvent::Closed)` on a clean close;
    /// `Err` on a transport-level read failure (both end the forwarder).
    async fn recv(&mut self) -> std::io::Result<FrameEvent>;
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send_data(&mut self, frame: Frame) -> std::io::Result<()>;
    async fn send_ping(&mut self, payload: Vec<u8>) -> std::io::Result<()>;
    async fn send_close(&mut self, code: u16, reason: &str) -> std::io::Result<()>;
}

fn io_err(msg: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(msg.to_string())
}

// ---- Client side (axum) -----------------------------------------------

pub struct ClientSource(pub SplitStream<WebSocket>);
pub struct ClientSink(pub SplitSink<WebSocket, AxumMessage>);

#[async_trait]
impl FrameSource for ClientSource {
    async fn recv(&mut self) -> std::io::Result<FrameEvent> {
        loop {
            return match self.0.next().await {
                None => Ok(FrameEvent::Closed),
                Some(Err(e)) => Err(io_err(e)),
                Some(Ok(AxumMessage::Text(t))) => Ok(FrameEvent::Data(Frame::Text(t.to_string()))),
                Some(Ok(AxumMessage::Binary(b))) => {
                    Ok(FrameEvent::Data(Frame::Binary(b.to_vec())))
                }
                Some(Ok(AxumMessage::Pong(p))) => Ok(FrameEvent::Pong(p.to_vec())),
                Some(Ok(AxumMessage::Close(_))) => Ok(FrameEvent::Closed),
                Some(Ok(AxumMessage::Ping(_))) => continue,
            };
        }
    }
}

#[async_trait]
impl FrameSink for ClientSink {
    async fn send_data(&mut self, frame: Frame) -> std::io::Result<()> {
        let msg = match frame {
            Frame::Text(t) => AxumMessage::Text(t.into()),
            Frame::Binary(b) => AxumMessage::Binary(b.into()),
        };
        self.0.send(msg).await.map_err(io_err)
    }

    async fn send_ping(&mut self, payload: Vec<u8>) -> std::io::Result<()> {
        self.0
            .send(AxumMessage::Ping(payload.into()))
            .await
            .map_err(io_err)
    }

    async fn send_close(&mut self, code: u16, reason: &str) -> std::io::Result<()> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        self.0
            .send(AxumMessage::Close(Some(frame)))
            .await
            .map_err(io_err)
    }
}

// ---- Upstream side (tokio-tungstenite) ---------------------------------

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct UpstreamSource(pub SplitStream<UpstreamStream>);
pub struct UpstreamSink(pub SplitSink<UpstreamStream, TungMessage>);

#[async_trait]
impl FrameSource for UpstreamSource {
    async fn recv(&mut self) -> std::io::Result<FrameEvent> {
        loop {
            return match self.0.next().await {
                None => Ok(FrameEvent::Closed),
                Some(Err(e)) => Err(io_err(e)),
                Some(Ok(TungMessage::Text(t))) => {
                    Ok(FrameEvent::Data(Frame::Text(t.to_string())))
                }
                Some(Ok(TungMessage::Binary(b))) => {
                    Ok(FrameEvent::Data(Frame::Binary(b.to_vec())))
                }
                Some(Ok(TungMessage::Pong(p))) => Ok(FrameEvent::Pong(p.to_vec())),
                Some(Ok(TungMessage::Close(_))) => Ok(FrameEvent::Closed),
                Some(Ok(TungMessage::Ping(_))) | Some(Ok(TungMessage::Frame(_))) => continue,
            };
        }
    }
}

#[async_trait]
impl FrameSink for UpstreamSink {
    async fn send_data(&mut self, frame: Frame) -> std::io::Result<()> {
        let msg = match frame {
            Frame::Text(t) => TungMessage::Text(t.into()),
            Frame::Binary(b) => TungMessage::Binary(b.into()),
        };
        self.0.send(msg).await.map_err(io_err)
    }

    async fn send_ping(&mut self, payload: Vec<u8>) -> std::io::Result<()> {
        self.0
            .send(TungMessage::Ping(payload.into()))
            .await
            .map_err(io_err)
    }

    async fn send_close(&mut self, code: u16, reason: &str) -> std::io::Result<()> {
        let frame = TungCloseFrame {
            code: code.into(),
            reason: reason.to_string().into(),
        };
        self.0
            .send(TungMessage::Close(Some(frame)))
            .await
            .map_err(io_err)
    }
}
