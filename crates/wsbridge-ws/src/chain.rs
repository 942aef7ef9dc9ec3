use async_trait::async_trait;

use crate::Frame;

/// One pipeline element. Inspectors only ever observe text frames — the
/// chain runner passes binary frames straight through without invoking
/// anyone (spec.md §4.3: "Inspectors observing binary frames must pass them
/// through unchanged — all implementations work on text only").
///
/// Returning `None` suppresses the frame: the forwarder must not write it.
/// Implementations that fail to parse their expected shape must return
/// `Some(text)` unchanged (fail-open, spec.md §7) rather than `None` or an
/// error.
#[async_trait]
pub trait Inspector: Send + Sync {
    async fn inspect(&self, text: String) -> Option<String>;

    /// Human-readable name for logging.
    fn name(&self) -> &'static str;
}

/// A fixed-order composition of inspectors for one direction.
pub struct InspectorChain {
    inspectors: Vec<Box<dyn Inspector>>,
}

impl InspectorChain {
    pub fn new(inspectors: Vec<Box<dyn Inspector>>) -> Self {
        Self { inspectors }
    }

    /// Run `frame` through the chain. Binary frames bypass the chain
    /// entirely. A `None` from any inspector short-circuits the remainder.
    pub async fn run(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Binary(bytes) => Some(Frame::Binary(bytes)),
            Frame::Text(mut text) => {
                for inspector in &self.inspectors {
                    match inspector.inspect(text).await {
                        Some(next) => text = next,
                        None => {
                            tracing::trace!(inspector = inspector.name(), "frame suppressed");
                            return None;
                        }
                    }
                }
                Some(Frame::Text(text))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;
    #[async_trait]
    impl Inspector for Uppercase {
        async fn inspect(&self, text: String) -> Option<String> {
            Some(text.to_uppercase())
        }
        fn name(&self) -> &'static str {
            "uppercase"
        }
    }

    struct Suppressor;
    #[async_trait]
    impl Inspector for Suppressor {
        async fn inspect(&self, _text: String) -> Option<String> {
            None
        }
        fn name(&self) -> &'static str {
            "suppressor"
        }
    }

    #[tokio::test]
    async fn chain_applies_inspectors_in_order() {
        let chain = InspectorChain::new(vec![Box::new(Uppercase), Box::new(Uppercase)]);
        let out = chain.run(Frame::Text("hi".into())).await;
        assert_eq!(out, Some(Frame::Text("HI".into())));
    }

    #[tokio::test]
    async fn suppression_short_circuits() {
        let chain = InspectorChain::new(vec![Box::new(Suppressor), Box::new(Uppercase)]);
        let out = chain.run(Frame::Text("hi".into())).await;
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn binary_frames_bypass_all_inspectors() {
        let chain = InspectorChain::new(vec![Box::new(Suppressor)]);
        let out = chain.run(Frame::Binary(vec![1, 2, 3])).await;
        assert_eq!(out, Some(Frame::Binary(vec![1, 2, 3])));
    }
}
