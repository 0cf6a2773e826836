use crate::buffer::OfflineBuffer;
use crate::config::Config;
use crate::payload::{ShockAlertPayload, TelemetryPayload, ALERTS_TOPIC};
use crate::publisher::TransportPublisher;
use crate::sensors::SensorBank;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Idle sleep between loop iterations. Short enough that the 20 ms motion
/// cadence holds.
const TICK: Duration = Duration::from_millis(5);

/// Probability per probe read of a non-finite value from the simulated
/// sensor bank.
const SENSOR_FAULT_RATE: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Connectivity,
    MotionSample,
    ShockFlush,
    Telemetry,
    BufferDrain,
}

/// One periodic concern in the scheduling table.
struct Slot {
    task: Task,
    interval: Duration,
    last_run: Option<Instant>,
}

impl Slot {
    fn new(task: Task, interval: Duration) -> Self {
        Self {
            task,
            interval,
            last_run: None,
        }
    }

    fn due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        }
    }
}

/// Single-threaded cooperative loop driving every edge concern.
///
/// Each iteration walks a fixed table of task slots and performs at most
/// one unit of work per due slot, so no concern can starve another. Slot
/// order is deliberate: a latched shock flushes ahead of the next periodic
/// reading.
pub struct Scheduler {
    cfg: Config,
    slots: Vec<Slot>,
    sensors: SensorBank,
    buffer: OfflineBuffer,
    publisher: TransportPublisher,
    shock_peak: f64,
    last_shock: f64,
    last_fix: (f64, f64),
}

impl Scheduler {
    pub fn new(cfg: Config) -> Self {
        let sensors = SensorBank::new(cfg.base_lat, cfg.base_lon, SENSOR_FAULT_RATE);
        let buffer = OfflineBuffer::open(cfg.buffer_path.clone(), cfg.buffer_max_records);
        let publisher = TransportPublisher::new(&cfg.broker, cfg.port, &cfg.device_id);
        Self::with_parts(cfg, sensors, buffer, publisher)
    }

    fn with_parts(
        cfg: Config,
        sensors: SensorBank,
        buffer: OfflineBuffer,
        publisher: TransportPublisher,
    ) -> Self {
        let slots = vec![
            Slot::new(Task::Connectivity, Duration::from_millis(cfg.connect_retry_ms)),
            Slot::new(Task::MotionSample, Duration::from_millis(cfg.motion_interval_ms)),
            Slot::new(Task::ShockFlush, Duration::ZERO),
            Slot::new(Task::Telemetry, Duration::from_millis(cfg.telemetry_interval_ms)),
            Slot::new(Task::BufferDrain, Duration::ZERO),
        ];
        let last_fix = (cfg.base_lat, cfg.base_lon);
        Self {
            cfg,
            slots,
            sensors,
            buffer,
            publisher,
            shock_peak: 0.0,
            last_shock: 0.0,
            last_fix,
        }
    }

    /// Runs until device reset. No error terminates the loop; a failed tick
    /// just leaves its work for the next one.
    pub async fn run(mut self) {
        info!("Edge scheduler started");
        loop {
            // An established session is serviced every iteration so acks
            // and keep-alive traffic are never starved.
            if self.publisher.is_connected() {
                self.publisher.service_once().await;
            }

            let now = Instant::now();
            for i in 0..self.slots.len() {
                if !self.slots[i].due(now) {
                    continue;
                }
                self.slots[i].last_run = Some(now);
                let task = self.slots[i].task;
                match task {
                    Task::Connectivity => self.maintain_connectivity().await,
                    Task::MotionSample => self.sample_motion(),
                    Task::ShockFlush => self.flush_shock().await,
                    Task::Telemetry => self.publish_telemetry().await,
                    Task::BufferDrain => self.drain_buffer().await,
                }
            }

            tokio::time::sleep(TICK).await;
        }
    }

    async fn maintain_connectivity(&mut self) {
        if self.publisher.is_connected() {
            return;
        }
        debug!("attempting broker connection");
        let connect_timeout = Duration::from_millis(self.cfg.connect_timeout_ms);
        if !self.publisher.try_connect(connect_timeout).await {
            debug!(retry_ms = self.cfg.connect_retry_ms, "broker unreachable");
        }
    }

    fn sample_motion(&mut self) {
        let g = self.sensors.sample_shock();
        if !g.is_finite() {
            return;
        }
        self.last_shock = g;
        if g > self.shock_peak {
            self.shock_peak = g;
        }
    }

    /// Emit a shock alert if any motion sample crossed the threshold since
    /// the last check. Runs every iteration, ahead of the telemetry slot.
    async fn flush_shock(&mut self) {
        let peak = std::mem::replace(&mut self.shock_peak, 0.0);
        if peak <= self.cfg.shock_threshold_g {
            return;
        }

        warn!(shock_g = peak, "shock threshold exceeded");
        let alert = ShockAlertPayload::new(
            self.cfg.device_id.clone(),
            peak,
            self.last_fix.0,
            self.last_fix.1,
            Utc::now().timestamp_millis(),
        );
        match serde_json::to_string(&alert) {
            Ok(json) => self.publish_or_buffer(ALERTS_TOPIC, json).await,
            Err(e) => error!(error = %e, "failed to serialize shock alert"),
        }
    }

    async fn publish_telemetry(&mut self) {
        let Some(sample) = self.sensors.sample_environment() else {
            debug!("sensor read unavailable, skipping tick");
            return;
        };
        self.last_fix = (sample.lat, sample.lon);

        let payload = TelemetryPayload {
            device_id: self.cfg.device_id.clone(),
            temp: sample.temperature,
            hum: sample.humidity,
            shock_g: self.last_shock,
            lat: sample.lat,
            lon: sample.lon,
            battery: sample.battery,
            door_open: sample.door_open,
            ts: Utc::now().timestamp_millis(),
        };
        let topic = payload.topic();
        match serde_json::to_string(&payload) {
            Ok(json) => self.publish_or_buffer(&topic, json).await,
            Err(e) => error!(error = %e, "failed to serialize telemetry"),
        }
    }

    async fn drain_buffer(&mut self) {
        if !self.publisher.is_connected() || self.buffer.is_empty() {
            return;
        }
        match self.buffer.drain(&mut self.publisher).await {
            Ok(true) => {}
            Ok(false) => debug!("drain interrupted, will resume next pass"),
            Err(e) => warn!(error = %e, "drain failed to read buffer"),
        }
    }

    async fn publish_or_buffer(&mut self, topic: &str, json: String) {
        if self.publisher.try_publish(topic, &json).await {
            debug!(topic, "published");
        } else {
            self.buffer.append(topic, &json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::PathBuf;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("edge-sched-test-{}.log", uuid::Uuid::new_v4()))
    }

    fn test_scheduler(buffer_path: PathBuf) -> Scheduler {
        let mut cfg = Config::parse_from(["edge-agent"]);
        cfg.buffer_path = buffer_path;
        let sensors = SensorBank::new(cfg.base_lat, cfg.base_lon, 0.0);
        let buffer = OfflineBuffer::open(cfg.buffer_path.clone(), cfg.buffer_max_records);
        let publisher = TransportPublisher::new(&cfg.broker, cfg.port, &cfg.device_id);
        Scheduler::with_parts(cfg, sensors, buffer, publisher)
    }

    #[test]
    fn test_slot_due_gating() {
        let now = Instant::now();
        let mut slot = Slot::new(Task::Telemetry, Duration::from_secs(5));
        assert!(slot.due(now));

        slot.last_run = Some(now);
        assert!(!slot.due(now));
        assert!(slot.due(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_shock_flush_precedes_telemetry_in_table() {
        let path = temp_path();
        let scheduler = test_scheduler(path.clone());
        let shock = scheduler
            .slots
            .iter()
            .position(|s| s.task == Task::ShockFlush)
            .unwrap();
        let telemetry = scheduler
            .slots
            .iter()
            .position(|s| s.task == Task::Telemetry)
            .unwrap();
        assert!(shock < telemetry);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_telemetry_falls_back_to_buffer_when_disconnected() {
        tokio_test::block_on(async {
            let path = temp_path();
            let mut scheduler = test_scheduler(path.clone());

            scheduler.publish_telemetry().await;
            assert_eq!(scheduler.buffer.len(), 1);

            let _ = std::fs::remove_file(&path);
        });
    }

    #[test]
    fn test_shock_flush_only_fires_above_threshold() {
        tokio_test::block_on(async {
            let path = temp_path();
            let mut scheduler = test_scheduler(path.clone());

            scheduler.shock_peak = 1.0; // below the 2.5 g default
            scheduler.flush_shock().await;
            assert!(scheduler.buffer.is_empty());
            assert_eq!(scheduler.shock_peak, 0.0);

            scheduler.shock_peak = 5.0;
            scheduler.flush_shock().await;
            assert_eq!(scheduler.buffer.len(), 1);

            let _ = std::fs::remove_file(&path);
        });
    }

    #[test]
    fn test_motion_sample_latches_peak() {
        let path = temp_path();
        let mut scheduler = test_scheduler(path.clone());

        for _ in 0..100 {
            scheduler.sample_motion();
        }
        assert!(scheduler.shock_peak >= scheduler.last_shock);

        let _ = std::fs::remove_file(&path);
    }
}
