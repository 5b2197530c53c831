//! Command channel: the single path every outbound frame takes.

use std::{sync::Arc, time::Duration};
use tokio::{sync::Notify, time::timeout};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{error::Result, protocol::to_hex, transport::Transport};

/// Tracing target for the wire trace
pub const WIRE_TARGET: &str = "proformers::wire";

/// Per-send options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Free-form label carried in the wire trace
    pub label: &'static str,
    /// Skip the wire trace
    pub log_suppressed: bool,
    /// Block until the device answers or the response timeout elapses
    pub wait_for_response: bool,
}

impl SendOptions {
    /// Fire-and-forget send
    #[must_use]
    pub const fn fire(label: &'static str) -> Self {
        Self {
            label,
            log_suppressed: false,
            wait_for_response: false,
        }
    }

    /// Send and wait for a response
    #[must_use]
    pub const fn awaiting(label: &'static str) -> Self {
        Self {
            label,
            log_suppressed: false,
            wait_for_response: true,
        }
    }

    /// Same options with the wire trace suppressed
    #[must_use]
    pub const fn quiet(self) -> Self {
        Self {
            log_suppressed: true,
            ..self
        }
    }
}

/// What happened to a frame handed to [`CommandChannel::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Channel not ready, frame dropped
    Skipped,
    /// Written, no response requested
    Written,
    /// Written and the device answered in time
    Answered,
    /// Written but nothing came back before the timeout
    TimedOut,
}

/// Writes frames to the device's write characteristic
pub struct CommandChannel<T: Transport> {
    transport: Arc<T>,
    write_char: Option<Uuid>,
    responses: Arc<Notify>,
    response_timeout: Duration,
}

impl<T: Transport> CommandChannel<T> {
    /// Create a channel that is not yet ready
    pub fn new(transport: Arc<T>, response_timeout: Duration) -> Self {
        Self {
            transport,
            write_char: None,
            responses: Arc::new(Notify::new()),
            response_timeout,
        }
    }

    /// Signal to pulse whenever the device notifies or acknowledges a write
    #[must_use]
    pub fn responses(&self) -> Arc<Notify> {
        self.responses.clone()
    }

    /// Route writes to `characteristic` from now on
    pub fn attach(&mut self, characteristic: Uuid) {
        self.write_char = Some(characteristic);
    }

    /// Drop every later write until attached again
    pub fn detach(&mut self) {
        self.write_char = None;
    }

    /// Whether a write characteristic is attached
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.write_char.is_some()
    }

    /// Write `frame` to the device.
    ///
    /// A timed-out wait is not an error and the frame is never resent.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the write itself fails.
    pub async fn send(&self, frame: &[u8], options: SendOptions) -> Result<SendOutcome> {
        let Some(characteristic) = self.write_char else {
            trace!(label = options.label, "channel not ready, dropping frame");
            return Ok(SendOutcome::Skipped);
        };

        // Registered before the write so an instant answer is not missed.
        let answered = self.responses.notified();
        tokio::pin!(answered);
        answered.as_mut().enable();

        self.transport.write(characteristic, frame).await?;

        if !options.log_suppressed {
            debug!(
                target: WIRE_TARGET,
                direction = ">>",
                payload = %to_hex(frame),
                label = options.label,
                "frame"
            );
        }

        if !options.wait_for_response {
            return Ok(SendOutcome::Written);
        }

        if timeout(self.response_timeout, answered).await.is_ok() {
            Ok(SendOutcome::Answered)
        } else {
            debug!(
                label = options.label,
                timeout = ?self.response_timeout,
                "no response before timeout"
            );
            Ok(SendOutcome::TimedOut)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        mock::{MockTransport, WriteReply},
        TransportEvent,
    };
    use futures::StreamExt;
    use tokio::time::Instant;
    use tokio_test::assert_ok;

    async fn ready_channel(mock: Arc<MockTransport>) -> CommandChannel<MockTransport> {
        assert_ok!(mock.connect().await);
        let mut channel = CommandChannel::new(mock.clone(), Duration::from_millis(300));
        channel.attach(crate::WRITE_CHAR_UUID);

        let responses = channel.responses();
        let mut events = mock.events().await.unwrap();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if matches!(
                    event,
                    TransportEvent::Written { .. } | TransportEvent::Notification { .. }
                ) {
                    responses.notify_waiters();
                }
            }
        });
        channel
    }

    #[tokio::test]
    async fn test_unattached_channel_drops_frames() {
        let mock = Arc::new(MockTransport::new());
        assert_ok!(mock.connect().await);
        let channel = CommandChannel::new(mock.clone(), Duration::from_millis(300));

        let outcome = channel.send(&[0xfe, 0x02, 0x0d, 0x02], SendOptions::fire("noOp")).await;
        assert_eq!(outcome.unwrap(), SendOutcome::Skipped);
        assert!(mock.written().is_empty());
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let mock = Arc::new(MockTransport::new());
        let channel = ready_channel(mock.clone()).await;

        let outcome = channel.send(&[1, 2, 3, 4], SendOptions::fire("init")).await;
        assert_eq!(outcome.unwrap(), SendOutcome::Written);
        assert_eq!(mock.written(), vec![vec![1, 2, 3, 4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_on_ack() {
        let mock = Arc::new(MockTransport::new());
        let channel = ready_channel(mock.clone()).await;

        let started = Instant::now();
        let outcome = channel
            .send(&[0u8; 20], SendOptions::awaiting("forceSpeed"))
            .await;
        assert_eq!(outcome.unwrap(), SendOutcome::Answered);
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_resend() {
        let mock = Arc::new(MockTransport::new());
        mock.set_reply(WriteReply::Silent);
        let channel = ready_channel(mock.clone()).await;

        let started = Instant::now();
        let outcome = channel
            .send(&[0u8; 20], SendOptions::awaiting("forceSpeed").quiet())
            .await;
        assert_eq!(outcome.unwrap(), SendOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(mock.written().len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_propagates() {
        let mock = Arc::new(MockTransport::new());
        let mut channel = CommandChannel::new(mock.clone(), Duration::from_millis(300));
        channel.attach(crate::WRITE_CHAR_UUID);

        let outcome = channel.send(&[0u8; 4], SendOptions::fire("noOp")).await;
        assert!(outcome.is_err());
    }
}
