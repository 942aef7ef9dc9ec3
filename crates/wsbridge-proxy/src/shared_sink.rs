//! Wraps one [`FrameSink`] behind a mutex so the forwarder writing data
//! frames and the keepalive task pinging the same side can share it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use wsbridge_ws::{DirectWriter, Frame, FrameSink};

pub struct SharedSink<D>(Arc<Mutex<D>>);

impl<D> Clone for SharedSink<D> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<D: FrameSink> SharedSink<D> {
    pub fn new(sink: D) -> Self {
        Self(Arc::new(Mutex::new(sink)))
    }

    pub async fn send_data(&self, frame: Frame) -> std::io::Result<()> {
        self.0.lock().await.send_data(frame).await
    }

    pub async fn send_ping(&self, payload: Vec<u8>) -> std::io::Result<()> {
        self.0.lock().await.send_ping(payload).await
    }

    pub async fn send_close(&self, code: u16, reason: &str) -> std::io::Result<()> {
        self.0.lock().await.send_close(code, reason).await
    }
}

/// Lets inspectors (chat-sync broadcast, canvas replay) write straight to a
/// connection's shared sink without going through the forwarder loop.
#[async_trait]
impl<D: FrameSink + Send> DirectWriter for SharedSink<D> {
    async fn send_text(&self, text: String) -> std::io::Result<()> {
        self.send_data(Frame::Text(text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink(Arc<StdMutex<Vec<Frame>>>);

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_data(&mut self, frame: Frame) -> std::io::Result<()> {
            self.0.lock().unwrap().push(frame);
            Ok(())
        }
        async fn send_ping(&mut self, _payload: Vec<u8>) -> std::io::Result<()> {
            Ok(())
        }
        async fn send_close(&mut self, _code: u16, _reason: &str) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn direct_writer_send_text_goes_through_send_data() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = SharedSink::new(RecordingSink(received.clone()));
        DirectWriter::send_text(&sink, "hello".to_string())
            .await
            .unwrap();
        assert_eq!(*received.lock().unwrap(), vec![Frame::Text("hello".into())]);
    }

    #[tokio::test]
    async fn clone_shares_the_same_underlying_sink() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = SharedSink::new(RecordingSink(received.clone()));
        let cloned = sink.clone();
        sink.send_data(Frame::Text("a".into())).await.unwrap();
        cloned.send_data(Frame::Text("b".into())).await.unwrap();
        assert_eq!(
            *received.lock().unwrap(),
            vec![Frame::Text("a".into()), Frame::Text("b".into())]
        );
    }
}
