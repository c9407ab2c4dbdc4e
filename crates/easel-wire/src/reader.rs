//! Ordered event stream over a chunked response body
//!
//! The reader is pull-based: the next network chunk is not consumed until
//! the caller has finished handling the previous frame, which both keeps
//! event application strictly in arrival order and gives a slow consumer
//! natural backpressure against the transport.

use std::pin::Pin;
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use tokio_stream::Stream;

use crate::decoder::FrameDecoder;
use crate::error::{Error, Result};
use crate::events::StreamEvent;

/// A stream of decoded, typed events
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Tunables for reading a streamed response
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Maximum time to wait for the next chunk before giving up on the
    /// stream. A hung connection surfaces as `Error::Stalled` instead of
    /// leaving the turn streaming forever.
    pub stall_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(120),
        }
    }
}

/// Decode a chunked byte source into typed events.
///
/// Ends on normal source completion; a decode failure or stall yields one
/// `Err` and stops. An incomplete trailing frame at end of stream is
/// dropped (the transport closed mid-frame).
pub fn decode_stream<S, B>(source: S, config: ReaderConfig) -> FrameStream
where
    S: Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    Box::pin(stream! {
        let mut source = std::pin::pin!(source);
        let mut decoder = FrameDecoder::new();

        loop {
            let next = tokio::time::timeout(config.stall_timeout, source.next()).await;
            let chunk = match next {
                Err(_) => {
                    yield Err(Error::Stalled);
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    yield Err(e);
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            for raw in decoder.push(chunk.as_ref()) {
                match StreamEvent::parse(&raw.event, &raw.data) {
                    Ok(event) => yield Ok(event),
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if decoder.has_partial() {
            tracing::debug!("stream ended with an incomplete trailing frame; dropping it");
        }
    })
}
