//! Per-connection protocol state: initialization and the poll cycle.
//!
//! A [`Session`] lives from the moment the link comes up until it drops. It
//! is owned by the driver task and handed by `&mut` to whatever needs it, so
//! the poll counter and the pending request slots have exactly one writer.

use std::{ops::RangeInclusive, time::Duration};
use tracing::{debug, info, trace};

use crate::{
    channel::{CommandChannel, SendOptions, SendOutcome},
    error::Result,
    metrics::MetricsSnapshot,
    protocol::{
        encode_incline, encode_speed, AnnounceFrame, CommandFrame, INCLINE_RANGE, SPEED_RANGE,
    },
    transport::Transport,
    types::ConnectionPhase,
    variant::DeviceVariant,
};

/// Verdict on a pending speed/incline request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Write it
    Send,
    /// Outside the legal range, dropped
    OutOfRange,
    /// Equal to the last known value, dropped
    Unchanged,
}

/// Decide whether `value` should go out given the last known `current` value
#[must_use]
pub fn validate_request(value: f64, current: f64, range: &RangeInclusive<f64>) -> RequestOutcome {
    if !range.contains(&value) {
        RequestOutcome::OutOfRange
    } else if (value - current).abs() < f64::EPSILON {
        RequestOutcome::Unchanged
    } else {
        RequestOutcome::Send
    }
}

/// What one poll tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// Not ready, nothing sent
    Idle,
    /// Keep-alive written for `index`
    Polled {
        /// Poll index that was served
        index: usize,
        /// Command frames written on this tick
        commands: usize,
    },
}

/// Protocol state for one connection
#[derive(Debug, Clone)]
pub struct Session {
    phase: ConnectionPhase,
    variant: DeviceVariant,
    poll_index: usize,
    pending_speed: Option<f64>,
    pending_incline: Option<f64>,
    initialized: bool,
}

impl Session {
    /// Fresh session for `variant`
    #[must_use]
    pub const fn new(variant: DeviceVariant) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            variant,
            poll_index: 0,
            pending_speed: None,
            pending_incline: None,
            initialized: false,
        }
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Move to `phase`
    pub fn set_phase(&mut self, phase: ConnectionPhase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "session phase");
            self.phase = phase;
        }
    }

    /// Next poll index to be served
    #[must_use]
    pub const fn poll_index(&self) -> usize {
        self.poll_index
    }

    /// Whether the init sequence has completed
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Pending speed request, if any
    #[must_use]
    pub const fn pending_speed(&self) -> Option<f64> {
        self.pending_speed
    }

    /// Pending incline request, if any
    #[must_use]
    pub const fn pending_incline(&self) -> Option<f64> {
        self.pending_incline
    }

    /// Rewind to a fresh connection after a failed connect attempt.
    /// Pending requests stay queued for the next `Ready`.
    pub fn relink(&mut self) {
        self.set_phase(ConnectionPhase::Disconnected);
        self.poll_index = 0;
        self.initialized = false;
    }

    /// Queue a speed change; replaces any earlier unsent request
    pub fn request_speed(&mut self, value: f64) {
        self.pending_speed = Some(value);
    }

    /// Queue an incline change; replaces any earlier unsent request
    pub fn request_incline(&mut self, value: f64) {
        self.pending_incline = Some(value);
    }

    /// Write the variant's init frames, pausing `delay` after each.
    ///
    /// # Errors
    ///
    /// Returns the first transport write error; the session stays
    /// uninitialized in that case.
    pub async fn run_initialization<T: Transport>(
        &mut self,
        channel: &CommandChannel<T>,
        delay: Duration,
    ) -> Result<()> {
        self.set_phase(ConnectionPhase::Initializing);
        let frames = self.variant.init_sequence();
        info!(variant = %self.variant, frames = frames.len(), "running init sequence");

        for frame in frames {
            channel.send(frame, SendOptions::fire("init")).await?;
            tokio::time::sleep(delay).await;
        }

        self.initialized = true;
        self.set_phase(ConnectionPhase::Ready);
        info!("init sequence complete");
        Ok(())
    }

    /// Serve one poll tick.
    ///
    /// `current` is the latest snapshot; pending requests equal to its speed
    /// or incline are dropped.
    ///
    /// # Errors
    ///
    /// Returns the transport error of a failed write. The counter has already
    /// advanced and the pending slots are already cleared by then.
    pub async fn tick<T: Transport>(
        &mut self,
        channel: &CommandChannel<T>,
        current: &MetricsSnapshot,
    ) -> Result<TickReport> {
        if self.phase != ConnectionPhase::Ready || !self.initialized {
            return Ok(TickReport::Idle);
        }

        let index = self.poll_index;
        self.poll_index = (index + 1) % self.variant.poll_len();

        let step = self.variant.poll_sequence()[index];
        let options = if step.log_suppressed {
            SendOptions::fire("noOp").quiet()
        } else {
            SendOptions::fire("noOp")
        };
        channel.send(step.frame, options).await?;

        let commands = if index == self.variant.command_slot() {
            self.apply_pending(channel, current).await?
        } else {
            0
        };

        Ok(TickReport::Polled { index, commands })
    }

    async fn apply_pending<T: Transport>(
        &mut self,
        channel: &CommandChannel<T>,
        current: &MetricsSnapshot,
    ) -> Result<usize> {
        let mut commands = 0;

        if let Some(value) = self.pending_incline.take() {
            let sent = Self::dispatch(
                channel,
                "forceIncline",
                value,
                current.incline,
                &INCLINE_RANGE,
                encode_incline,
            )
            .await?;
            commands += usize::from(sent);
        }

        if let Some(value) = self.pending_speed.take() {
            let sent = Self::dispatch(
                channel,
                "forceSpeed",
                value,
                current.speed,
                &SPEED_RANGE,
                encode_speed,
            )
            .await?;
            commands += usize::from(sent);
        }

        Ok(commands)
    }

    async fn dispatch<T: Transport>(
        channel: &CommandChannel<T>,
        label: &'static str,
        value: f64,
        current: f64,
        range: &RangeInclusive<f64>,
        encode: fn(f64) -> (AnnounceFrame, CommandFrame),
    ) -> Result<bool> {
        match validate_request(value, current, range) {
            RequestOutcome::Send => {}
            outcome => {
                debug!(label, value, current, ?outcome, "request dropped");
                return Ok(false);
            }
        }

        let (announce, command) = encode(value);
        channel.send(announce.as_bytes(), SendOptions::fire(label)).await?;
        let outcome = channel
            .send(command.as_bytes(), SendOptions::awaiting(label))
            .await?;
        if outcome == SendOutcome::TimedOut {
            trace!(label, value, "command not acknowledged, not retried");
        }
        Ok(outcome != SendOutcome::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{checksum, CHECKSUM_OFFSET, COMMAND_ANNOUNCE, FRAME_SIZE},
        transport::mock::{MockTransport, WriteReply},
    };
    use std::sync::Arc;
    use tokio_test::assert_ok;

    type Fixture = (Arc<MockTransport>, CommandChannel<MockTransport>, Session);

    async fn ready(variant: DeviceVariant) -> Fixture {
        let mock = Arc::new(MockTransport::new());
        // no event pump in these tests, every wait runs into the timeout
        mock.set_reply(WriteReply::Silent);
        assert_ok!(mock.connect().await);

        let mut channel = CommandChannel::new(mock.clone(), Duration::from_millis(300));
        channel.attach(crate::WRITE_CHAR_UUID);

        let mut session = Session::new(variant);
        assert_ok!(session.run_initialization(&channel, Duration::from_millis(400)).await);
        mock.clear_written();
        (mock, channel, session)
    }

    fn is_command(frame: &[u8]) -> bool {
        frame.len() == FRAME_SIZE && frame[..2] == [0xff, 0x0d]
    }

    #[test]
    fn test_validate_request() {
        assert_eq!(validate_request(5.0, 0.0, &SPEED_RANGE), RequestOutcome::Send);
        assert_eq!(validate_request(22.0, 0.0, &SPEED_RANGE), RequestOutcome::Send);
        assert_eq!(validate_request(22.1, 0.0, &SPEED_RANGE), RequestOutcome::OutOfRange);
        assert_eq!(validate_request(-0.5, 0.0, &SPEED_RANGE), RequestOutcome::OutOfRange);
        assert_eq!(validate_request(f64::NAN, 0.0, &SPEED_RANGE), RequestOutcome::OutOfRange);
        assert_eq!(validate_request(20.0, 0.0, &INCLINE_RANGE), RequestOutcome::OutOfRange);
        assert_eq!(validate_request(3.0, 3.0, &INCLINE_RANGE), RequestOutcome::Unchanged);
    }

    #[test]
    fn test_latest_request_wins() {
        let mut session = Session::new(DeviceVariant::Generic);
        session.request_speed(4.0);
        session.request_speed(6.5);
        assert_eq!(session.pending_speed(), Some(6.5));
        assert_eq!(session.pending_incline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relink_keeps_pending_requests() {
        let (_mock, channel, mut session) = ready(DeviceVariant::Generic).await;
        assert_ok!(session.tick(&channel, &MetricsSnapshot::default()).await);
        session.request_speed(7.0);
        session.request_incline(1.5);

        session.relink();

        assert_eq!(session.phase(), ConnectionPhase::Disconnected);
        assert!(!session.is_initialized());
        assert_eq!(session.poll_index(), 0);
        assert_eq!(session.pending_speed(), Some(7.0));
        assert_eq!(session.pending_incline(), Some(1.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialization_writes_every_frame() {
        let mock = Arc::new(MockTransport::new());
        assert_ok!(mock.connect().await);
        let mut channel = CommandChannel::new(mock.clone(), Duration::from_millis(300));
        channel.attach(crate::WRITE_CHAR_UUID);

        let mut session = Session::new(DeviceVariant::AltProtocol);
        let started = tokio::time::Instant::now();
        assert_ok!(session.run_initialization(&channel, Duration::from_millis(400)).await);

        let expected: Vec<Vec<u8>> = DeviceVariant::AltProtocol
            .init_sequence()
            .iter()
            .map(|f| f.to_vec())
            .collect();
        assert_eq!(mock.written(), expected);
        assert!(started.elapsed() >= Duration::from_millis(400 * 16));
        assert!(session.is_initialized());
        assert_eq!(session.phase(), ConnectionPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_until_ready() {
        let mock = Arc::new(MockTransport::new());
        assert_ok!(mock.connect().await);
        let mut channel = CommandChannel::new(mock.clone(), Duration::from_millis(300));
        channel.attach(crate::WRITE_CHAR_UUID);

        let mut session = Session::new(DeviceVariant::Generic);
        session.request_speed(5.0);
        for _ in 0..10 {
            let report = session.tick(&channel, &MetricsSnapshot::default()).await;
            assert_eq!(report.unwrap(), TickReport::Idle);
        }
        assert!(mock.written().is_empty());
        assert_eq!(session.poll_index(), 0);
        assert_eq!(session.pending_speed(), Some(5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cycle_wraps_and_repeats() {
        for variant in [DeviceVariant::Generic, DeviceVariant::AltProtocol] {
            let (mock, channel, mut session) = ready(variant).await;
            let n = variant.poll_len();

            for _ in 0..n * 2 {
                assert_ok!(session.tick(&channel, &MetricsSnapshot::default()).await);
            }
            assert_eq!(session.poll_index(), 0);

            let written = mock.written();
            assert_eq!(written.len(), n * 2);
            assert_eq!(written[..n], written[n..]);
            for (frame, step) in written.iter().zip(variant.poll_sequence()) {
                assert_eq!(frame.as_slice(), step.frame);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_request_on_dispatch_tick() {
        let (mock, channel, mut session) = ready(DeviceVariant::Generic).await;
        session.request_speed(5.0);

        let slot = DeviceVariant::Generic.command_slot();
        for _ in 0..slot {
            assert_ok!(session.tick(&channel, &MetricsSnapshot::default()).await);
        }
        assert!(mock.written().iter().all(|f| !is_command(f)));
        assert_eq!(session.pending_speed(), Some(5.0));

        mock.clear_written();
        let report = session.tick(&channel, &MetricsSnapshot::default()).await;
        assert_eq!(report.unwrap(), TickReport::Polled { index: slot, commands: 1 });

        let written = mock.written();
        let commands: Vec<&Vec<u8>> = written.iter().filter(|f| is_command(f)).collect();
        assert_eq!(commands.len(), 1);

        let frame = commands[0];
        assert_eq!(frame[10], 0x01);
        assert_eq!(&frame[11..13], &500u16.to_le_bytes());
        let mut fixed = [0u8; FRAME_SIZE];
        fixed.copy_from_slice(frame);
        assert_eq!(frame[CHECKSUM_OFFSET], checksum(&fixed));

        assert_eq!(written[1], COMMAND_ANNOUNCE.to_vec());
        assert_eq!(session.pending_speed(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incline_goes_before_speed() {
        let (mock, channel, mut session) = ready(DeviceVariant::AltProtocol).await;
        session.request_speed(8.0);
        session.request_incline(4.0);

        for _ in 0..=DeviceVariant::AltProtocol.command_slot() {
            assert_ok!(session.tick(&channel, &MetricsSnapshot::default()).await);
        }

        let targets: Vec<u8> = mock
            .written()
            .iter()
            .filter(|f| is_command(f))
            .map(|f| f[10])
            .collect();
        assert_eq!(targets, vec![0x02, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_incline_is_cleared() {
        let (mock, channel, mut session) = ready(DeviceVariant::Generic).await;
        session.request_incline(20.0);

        for _ in 0..DeviceVariant::Generic.poll_len() {
            assert_ok!(session.tick(&channel, &MetricsSnapshot::default()).await);
        }

        assert!(mock.written().iter().all(|f| !is_command(f)));
        assert_eq!(mock.written().len(), DeviceVariant::Generic.poll_len());
        assert_eq!(session.pending_incline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_value_sends_nothing() {
        let (mock, channel, mut session) = ready(DeviceVariant::Generic).await;
        let current = MetricsSnapshot {
            speed: 6.0,
            incline: 2.0,
            ..MetricsSnapshot::default()
        };
        session.request_speed(6.0);
        session.request_incline(2.0);

        for _ in 0..DeviceVariant::Generic.poll_len() * 2 {
            assert_ok!(session.tick(&channel, &current).await);
        }

        assert!(mock.written().iter().all(|f| !is_command(f)));
        assert_eq!(session.pending_speed(), None);
        assert_eq!(session.pending_incline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_command_is_not_retried() {
        let (mock, channel, mut session) = ready(DeviceVariant::Generic).await;
        session.request_incline(3.5);

        for _ in 0..DeviceVariant::Generic.poll_len() * 3 {
            assert_ok!(session.tick(&channel, &MetricsSnapshot::default()).await);
        }

        let commands = mock.written().iter().filter(|f| is_command(f)).count();
        assert_eq!(commands, 1);
    }
}
