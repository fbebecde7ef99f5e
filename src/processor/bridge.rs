//! Processors living in another runtime.
//!
//! The coordinator thread is a plain OS thread, while analysis code may live inside an
//! async runtime (or any other thread with its own event loop). [`bridge`] creates a
//! pair: the [`BridgeProcessor`] is registered like any other processor, and the
//! [`BridgeEndpoint`] is polled by the foreign side. Each coordinator call becomes a
//! [`BridgeRequest`] that must be answered with a floor (or an error) before the
//! coordinator moves on to the next processor.

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::{Processor, ShotCursor};
use crate::data::{ChannelBufferSet, ShotRange};
use crate::error::DaqError;

/// Create a connected processor/endpoint pair.
///
/// `capacity` bounds the number of queued requests; with a single coordinator there is
/// at most one outstanding request, so 1 is enough.
pub fn bridge(name: impl Into<String>, capacity: usize) -> (BridgeProcessor, BridgeEndpoint) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        BridgeProcessor {
            name: name.into(),
            sender,
            cursor: ShotCursor::new(),
        },
        BridgeEndpoint { receiver },
    )
}

/// One `run` call forwarded to the foreign side.
#[derive(Debug)]
pub struct BridgeRequest {
    /// Buffers to read from (cheap clone sharing the sample stores).
    pub buffers: ChannelBufferSet,
    /// Range handed out by the coordinator.
    pub range: ShotRange,
    reply: oneshot::Sender<Result<u64, String>>,
}

impl BridgeRequest {
    /// Answer with the retention floor.
    pub fn respond(self, floor: u64) {
        if self.reply.send(Ok(floor)).is_err() {
            warn!("Bridge reply dropped: processor side is gone");
        }
    }

    /// Answer with a failure; the coordinator isolates it like a local error.
    pub fn fail(self, error: impl std::fmt::Display) {
        if self.reply.send(Err(error.to_string())).is_err() {
            warn!("Bridge failure reply dropped: processor side is gone");
        }
    }
}

/// Foreign-runtime end of a bridge.
#[derive(Debug)]
pub struct BridgeEndpoint {
    receiver: mpsc::Receiver<BridgeRequest>,
}

impl BridgeEndpoint {
    /// Next request, `None` once the processor has been dropped.
    pub async fn next(&mut self) -> Option<BridgeRequest> {
        self.receiver.recv().await
    }

    /// Blocking variant for a plain thread. Must not be called inside an async context.
    pub fn blocking_next(&mut self) -> Option<BridgeRequest> {
        self.receiver.blocking_recv()
    }
}

/// Coordinator-side half of a bridge.
#[derive(Debug)]
pub struct BridgeProcessor {
    name: String,
    sender: mpsc::Sender<BridgeRequest>,
    cursor: ShotCursor,
}

impl Processor for BridgeProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, _buffers: &ChannelBufferSet) -> anyhow::Result<()> {
        self.cursor.reset();
        Ok(())
    }

    fn run(&mut self, buffers: &ChannelBufferSet, range: ShotRange) -> anyhow::Result<u64> {
        let (reply, response) = oneshot::channel();
        let request = BridgeRequest {
            buffers: buffers.clone(),
            range,
            reply,
        };
        self.sender
            .blocking_send(request)
            .map_err(|_| DaqError::Bridge(format!("endpoint of '{}' is closed", self.name)))?;

        let floor = response
            .blocking_recv()
            .map_err(|_| {
                DaqError::Bridge(format!("endpoint of '{}' dropped the request", self.name))
            })?
            .map_err(|message| DaqError::Processor {
                name: self.name.clone(),
                message,
            })?;

        self.cursor.advance(range.to);
        Ok(floor)
    }

    fn cursor(&self) -> u64 {
        self.cursor.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_answered_from_another_thread() {
        let buffers = ChannelBufferSet::allocate(2, &[0], 16).unwrap();
        buffers.write(0, 3, 42);
        let (mut processor, mut endpoint) = bridge("remote", 1);

        let remote = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(request) = endpoint.blocking_next() {
                seen.push(request.buffers.read(0, 3));
                let floor = request.range.to - 1;
                request.respond(floor);
            }
            seen
        });

        assert_eq!(processor.run(&buffers, ShotRange::new(0, 5)).unwrap(), 4);
        assert_eq!(processor.cursor(), 5);
        drop(processor);
        assert_eq!(remote.join().unwrap(), vec![Some(42)]);
    }

    #[test]
    fn test_remote_failure_and_closed_endpoint_are_errors() {
        let buffers = ChannelBufferSet::allocate(1, &[0], 8).unwrap();
        let (mut processor, mut endpoint) = bridge("remote", 1);

        let remote = std::thread::spawn(move || {
            if let Some(request) = endpoint.blocking_next() {
                request.fail("analysis crashed");
            }
            // Endpoint dropped here.
        });

        let err = processor.run(&buffers, ShotRange::new(0, 4)).unwrap_err();
        assert!(err.to_string().contains("analysis crashed"));
        assert_eq!(processor.cursor(), 0);

        remote.join().unwrap();
        let err = processor.run(&buffers, ShotRange::new(0, 4)).unwrap_err();
        assert!(matches!(err.downcast_ref::<DaqError>(), Some(DaqError::Bridge(_))));
    }
}
