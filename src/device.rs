//! Connection state machine and the driver task that owns it.
//!
//! [`ProformTreadmill::start`] spawns one task that owns every piece of
//! mutable protocol state. Transport events, user requests and the poll
//! tick all arrive as [`DriverEvent`]s and are handled one at a time; the
//! returned [`DriverHandle`] only ever talks to the task through messages
//! and `watch` channels.

use futures::{stream::BoxStream, StreamExt};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    channel::{CommandChannel, WIRE_TARGET},
    error::{ProformError, Result},
    metrics::{MetricsAccumulator, MetricsSink, MetricsSnapshot, SampleOutcome},
    protocol::{decode, to_hex},
    session::{Session, TickReport},
    transport::{LinkState, Transport, TransportEvent},
    types::{ConnectionPhase, DriverConfig},
    NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID,
};

const EVENT_QUEUE: usize = 64;

/// Everything the driver task reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Telemetry notification from the device
    Notification(Vec<u8>),
    /// Write acknowledged by the device
    Ack,
    /// Link state reported by the transport
    LinkChanged(LinkState),
    /// Controller or service error
    ControllerError(String),
    /// Poll timer fired
    Tick,
    /// Queue a speed change
    RequestSpeed(f64),
    /// Queue an incline change
    RequestIncline(f64),
    /// Heart rate from an external sensor
    HeartRate(Option<u8>),
    /// Start a new workout
    ResetTotals,
    /// Tear the session down and stop
    Shutdown,
}

/// Entry point for driving a ProForm treadmill
pub struct ProformTreadmill;

impl ProformTreadmill {
    /// Spawn the driver task for `transport`.
    ///
    /// The task connects, discovers the iFit service, runs the init sequence
    /// and then polls until [`DriverHandle::shutdown`] is called or the
    /// session fails for good. Every handle dropped also stops the task.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use proformers::{find_treadmill, DriverConfig, NullSink, ProformTreadmill};
    /// use std::{sync::Arc, time::Duration};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let transport = find_treadmill("I_TL", Duration::from_secs(10)).await?;
    ///     let driver = ProformTreadmill::start(Arc::new(transport), DriverConfig::default(), NullSink);
    ///
    ///     driver.request_speed(6.0).await?;
    ///     driver.shutdown().await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn start<T, S>(transport: Arc<T>, config: DriverConfig, sink: S) -> DriverHandle
    where
        T: Transport,
        S: MetricsSink,
    {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Disconnected);
        let (metrics_tx, metrics_rx) = watch::channel(MetricsSnapshot {
            unit: config.settings.unit,
            ..MetricsSnapshot::default()
        });

        let driver = Driver {
            channel: CommandChannel::new(transport.clone(), config.timing.response_timeout()),
            session: Session::new(config.variant),
            metrics: MetricsAccumulator::new(Instant::now()),
            transport,
            config,
            sink,
            phase_tx,
            metrics_tx,
            events_rx,
            pump_tx: events_tx.downgrade(),
            reconnecting: false,
        };

        DriverHandle {
            events: events_tx,
            phase: phase_rx,
            metrics: metrics_rx,
            task: tokio::spawn(driver.run()),
        }
    }
}

/// Handle to a running driver task
pub struct DriverHandle {
    events: mpsc::Sender<DriverEvent>,
    phase: watch::Receiver<ConnectionPhase>,
    metrics: watch::Receiver<MetricsSnapshot>,
    task: JoinHandle<Result<()>>,
}

impl DriverHandle {
    async fn send(&self, event: DriverEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ProformError::DriverStopped)
    }

    /// Ask for a new belt speed, applied on the next command slot
    ///
    /// # Errors
    ///
    /// Returns [`ProformError::DriverStopped`] if the task has ended.
    pub async fn request_speed(&self, speed: f64) -> Result<()> {
        self.send(DriverEvent::RequestSpeed(speed)).await
    }

    /// Ask for a new incline, applied on the next command slot
    ///
    /// # Errors
    ///
    /// Returns [`ProformError::DriverStopped`] if the task has ended.
    pub async fn request_incline(&self, incline: f64) -> Result<()> {
        self.send(DriverEvent::RequestIncline(incline)).await
    }

    /// Incline request coming from a grade source such as a virtual ride.
    /// Downhill grades are flattened to zero.
    ///
    /// # Errors
    ///
    /// Returns [`ProformError::DriverStopped`] if the task has ended.
    pub async fn request_grade(&self, percentage: f64) -> Result<()> {
        self.request_incline(percentage.max(0.0)).await
    }

    /// Feed heart rate from an external sensor into the snapshot
    ///
    /// # Errors
    ///
    /// Returns [`ProformError::DriverStopped`] if the task has ended.
    pub async fn set_heart_rate(&self, heart_rate: Option<u8>) -> Result<()> {
        self.send(DriverEvent::HeartRate(heart_rate)).await
    }

    /// Zero distance and calories for a new workout
    ///
    /// # Errors
    ///
    /// Returns [`ProformError::DriverStopped`] if the task has ended.
    pub async fn reset_totals(&self) -> Result<()> {
        self.send(DriverEvent::ResetTotals).await
    }

    /// Current connection phase
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Whether the treadmill is ready for commands
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Ready
    }

    /// Latest published metrics
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.borrow().clone()
    }

    /// Receiver updated on every poll tick
    #[must_use]
    pub fn subscribe_metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        self.metrics.clone()
    }

    /// Receiver updated on every phase change
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.clone()
    }

    /// Stop the driver and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns the error the task ended with, if it ended on its own before
    /// the shutdown request arrived.
    pub async fn shutdown(self) -> Result<()> {
        // a closed queue means the task already ended, its result tells why
        let _ = self.events.send(DriverEvent::Shutdown).await;
        self.task
            .await
            .map_err(|e| ProformError::Other(format!("driver task failed: {e}")))?
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Driver<T: Transport, S: MetricsSink> {
    transport: Arc<T>,
    channel: CommandChannel<T>,
    session: Session,
    metrics: MetricsAccumulator,
    config: DriverConfig,
    sink: S,
    phase_tx: watch::Sender<ConnectionPhase>,
    metrics_tx: watch::Sender<MetricsSnapshot>,
    events_rx: mpsc::Receiver<DriverEvent>,
    pump_tx: mpsc::WeakSender<DriverEvent>,
    reconnecting: bool,
}

impl<T: Transport, S: MetricsSink> Driver<T, S> {
    async fn run(mut self) -> Result<()> {
        let events = self.transport.events().await?;
        let pump = tokio::spawn(pump_events(events, self.pump_tx.clone(), self.channel.responses()));

        let result = self.drive().await;
        pump.abort();

        if let Err(e) = &result {
            error!("Driver stopped: {}", e);
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        self.establish().await?;

        let mut ticker = interval(self.config.timing.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = ticker.tick() => DriverEvent::Tick,
                event = self.events_rx.recv() => event.unwrap_or(DriverEvent::Shutdown),
            };

            if let Flow::Stop = self.handle(event).await? {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, event: DriverEvent) -> Result<Flow> {
        match event {
            DriverEvent::Tick => self.on_tick().await?,
            DriverEvent::Notification(value) => self.on_notification(&value),
            DriverEvent::Ack => trace!("write acknowledged"),
            DriverEvent::LinkChanged(LinkState::Disconnected) => self.on_disconnect().await?,
            DriverEvent::LinkChanged(state) => debug!(?state, "link state"),
            DriverEvent::ControllerError(message) => warn!("Controller error: {}", message),
            DriverEvent::RequestSpeed(speed) => {
                info!("Speed requested: {:.1} {}", speed, self.config.settings.unit);
                self.session.request_speed(speed);
            }
            DriverEvent::RequestIncline(incline) => {
                info!("Incline requested: {:.1}%", incline);
                self.session.request_incline(incline);
            }
            DriverEvent::HeartRate(heart_rate) => self.metrics.set_heart_rate(heart_rate),
            DriverEvent::ResetTotals => {
                info!("Resetting workout totals");
                self.metrics.reset(Instant::now());
            }
            DriverEvent::Shutdown => {
                self.teardown().await;
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn publish_phase(&mut self, phase: ConnectionPhase) {
        self.session.set_phase(phase);
        self.phase_tx.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
    }

    /// Connect and walk the session up to `Ready`
    async fn establish(&mut self) -> Result<()> {
        match self.try_establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.link_lost();
                Err(e)
            }
        }
    }

    async fn try_establish(&mut self) -> Result<()> {
        self.publish_phase(ConnectionPhase::Connecting);
        info!("Connecting to treadmill ({})", self.config.variant);
        self.transport.connect().await?;
        self.transport.discover_services().await?;
        self.publish_phase(ConnectionPhase::ServiceDiscovered);

        for characteristic in [WRITE_CHAR_UUID, NOTIFY_CHAR_UUID] {
            if !self
                .transport
                .has_characteristic(SERVICE_UUID, characteristic)
                .await
            {
                return Err(ProformError::CharacteristicNotFound {
                    uuid: characteristic,
                });
            }
        }
        self.publish_phase(ConnectionPhase::CharacteristicsReady);

        self.transport.subscribe(NOTIFY_CHAR_UUID).await?;
        self.channel.attach(WRITE_CHAR_UUID);

        self.publish_phase(ConnectionPhase::Initializing);
        self.session
            .run_initialization(&self.channel, self.config.timing.init_step_delay())
            .await?;

        self.metrics.rebase(Instant::now());
        self.reconnecting = false;
        self.publish_phase(ConnectionPhase::Ready);
        info!("Treadmill ready");
        Ok(())
    }

    /// Release a link that never reached `Ready`, keeping queued requests
    fn link_lost(&mut self) {
        self.channel.detach();
        self.session.relink();
        self.publish_phase(ConnectionPhase::Disconnected);
    }

    /// Forget everything tied to the current link
    fn drop_session(&mut self) {
        self.channel.detach();
        self.session = Session::new(self.config.variant);
        self.publish_phase(ConnectionPhase::Disconnected);
    }

    async fn on_disconnect(&mut self) -> Result<()> {
        if self.session.phase() == ConnectionPhase::Disconnected && !self.reconnecting {
            return Ok(());
        }

        warn!("Treadmill disconnected");
        self.drop_session();
        self.reconnect().await
    }

    async fn reconnect(&mut self) -> Result<()> {
        info!("Reconnecting");
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Reconnect failed, retrying on next tick: {}", e);
                self.reconnecting = true;
                Ok(())
            }
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        if self.reconnecting {
            return self.reconnect().await;
        }
        if self.session.phase() != ConnectionPhase::Ready {
            return Ok(());
        }

        let snapshot = self.metrics.snapshot(&self.config.settings);
        self.sink.publish(&snapshot);
        self.metrics_tx.send_replace(snapshot.clone());

        match self.session.tick(&self.channel, &snapshot).await {
            Ok(TickReport::Polled { index, commands }) if commands > 0 => {
                debug!(index, commands, "commands dispatched");
            }
            Ok(_) => {}
            Err(e) => warn!("Poll write failed: {}", e),
        }
        Ok(())
    }

    fn on_notification(&mut self, value: &[u8]) {
        debug!(
            target: WIRE_TARGET,
            direction = "<<",
            payload = %to_hex(value),
            label = "notify",
            "frame"
        );

        if self.session.phase() != ConnectionPhase::Ready {
            return;
        }

        match decode(value, self.config.variant) {
            Ok(frame) => {
                let weight = self.config.settings.weight_kg;
                let outcome = self.metrics.ingest(&frame, Instant::now(), weight);
                if outcome == SampleOutcome::PowerRejected {
                    debug!(power = frame.power, "telemetry power out of range");
                }
            }
            Err(reason) => trace!(%reason, "notification ignored"),
        }
    }

    async fn teardown(&mut self) {
        info!("Shutting down treadmill driver");
        let was_linked = self.channel.is_ready();
        self.drop_session();
        self.reconnecting = false;

        if was_linked {
            if let Err(e) = self.transport.unsubscribe(NOTIFY_CHAR_UUID).await {
                warn!("Failed to unsubscribe: {}", e);
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to disconnect: {}", e);
        }
    }
}

/// Forward transport events into the driver queue.
///
/// Every notification and write-ack also wakes a send waiting for a
/// response; that happens here because the driver task itself is the one
/// waiting.
async fn pump_events(
    mut events: BoxStream<'static, TransportEvent>,
    driver: mpsc::WeakSender<DriverEvent>,
    responses: Arc<Notify>,
) {
    while let Some(event) = events.next().await {
        let event = match event {
            TransportEvent::Notification {
                characteristic,
                value,
            } => {
                responses.notify_waiters();
                if characteristic != NOTIFY_CHAR_UUID {
                    continue;
                }
                DriverEvent::Notification(value)
            }
            TransportEvent::Written { .. } => {
                responses.notify_waiters();
                DriverEvent::Ack
            }
            TransportEvent::StateChanged(state) => DriverEvent::LinkChanged(state),
            TransportEvent::Error(message) => DriverEvent::ControllerError(message),
        };

        let Some(driver) = driver.upgrade() else {
            break;
        };
        if driver.send(event).await.is_err() {
            break;
        }
    }
    trace!("transport event stream ended");
}
