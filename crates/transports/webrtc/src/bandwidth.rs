//! Adaptive split of the bitrate budget between video and the data channel
//!
//! Once per adjust interval the manager measures how much the data channel
//! carried, gives the video encoder what is left (bounded by the configured
//! min/max), smooths the change, and pushes the result to the encoder when
//! it moved by more than 5%.

use crate::config::BandwidthConfig;
use crate::session::DoneSignal;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Relative change below which a new bitrate is not applied
pub const HYSTERESIS: f64 = 0.05;

/// Encoder capability: accept a new target bitrate at runtime
pub trait BitrateControl: Send + Sync {
    fn set_bitrate(&self, bitrate_bps: u32) -> Result<()>;
}

/// The video encoder as seen by the bandwidth manager
#[derive(Clone, Default)]
pub enum EncoderSlot {
    /// No encoder yet; updates are tracked but go nowhere
    #[default]
    Unregistered,
    /// Encoder without runtime bitrate control; updates are a no-op
    Fixed,
    /// Encoder that accepts bitrate updates
    Adjustable(Arc<dyn BitrateControl>),
}

impl std::fmt::Debug for EncoderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderSlot::Unregistered => f.write_str("Unregistered"),
            EncoderSlot::Fixed => f.write_str("Fixed"),
            EncoderSlot::Adjustable(_) => f.write_str("Adjustable"),
        }
    }
}

/// [`BitrateControl`] for an encoder owned by another task
///
/// The encode loop holds the receiver and applies the latest value before
/// its next frame.
pub struct BitrateWatch {
    tx: watch::Sender<u32>,
}

impl BitrateWatch {
    pub fn channel(initial_bps: u32) -> (Arc<Self>, watch::Receiver<u32>) {
        let (tx, rx) = watch::channel(initial_bps);
        (Arc::new(Self { tx }), rx)
    }
}

impl BitrateControl for BitrateWatch {
    fn set_bitrate(&self, bitrate_bps: u32) -> Result<()> {
        self.tx
            .send(bitrate_bps)
            .map_err(|_| Error::CodecError("encoder task has stopped".to_string()))
    }
}

#[derive(Debug)]
struct BandwidthState {
    current_video_bitrate: u32,
    current_data_bandwidth: u32,
    /// Bytes per message type since the last tick
    traffic: HashMap<String, u64>,
    encoder: EncoderSlot,
}

/// Periodic video/data bitrate allocator
pub struct BandwidthManager {
    config: BandwidthConfig,
    state: Mutex<BandwidthState>,
    ticker: Mutex<Option<(DoneSignal, JoinHandle<()>)>>,
}

impl BandwidthManager {
    pub fn new(config: BandwidthConfig) -> Self {
        let current_video_bitrate = config
            .target_video_bitrate
            .clamp(config.min_video_bitrate, config.max_video_bitrate);
        let current_data_bandwidth = data_share(&config, current_video_bitrate);
        Self {
            config,
            state: Mutex::new(BandwidthState {
                current_video_bitrate,
                current_data_bandwidth,
                traffic: HashMap::new(),
                encoder: EncoderSlot::Unregistered,
            }),
            ticker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BandwidthConfig {
        &self.config
    }

    pub fn register_encoder(&self, encoder: EncoderSlot) {
        debug!(encoder = ?encoder, "Registered video encoder with bandwidth manager");
        self.state.lock().encoder = encoder;
    }

    /// Account `bytes` sent on the data channel for `msg_type`
    pub fn register_message_traffic(&self, msg_type: &str, bytes: usize) {
        let mut state = self.state.lock();
        match state.traffic.get_mut(msg_type) {
            Some(total) => *total += bytes as u64,
            None => {
                state.traffic.insert(msg_type.to_string(), bytes as u64);
            }
        }
    }

    /// Override the starting video bitrate (clamped to the configured range)
    pub fn set_initial_video_bitrate(&self, bitrate_bps: u32) {
        let bitrate = bitrate_bps.clamp(self.config.min_video_bitrate, self.config.max_video_bitrate);
        let mut state = self.state.lock();
        state.current_video_bitrate = bitrate;
        state.current_data_bandwidth = data_share(&self.config, bitrate);
    }

    pub fn current_video_bitrate(&self) -> u32 {
        self.state.lock().current_video_bitrate
    }

    /// Budget left for the data channel at the current video bitrate
    pub fn current_data_bandwidth(&self) -> u32 {
        self.state.lock().current_data_bandwidth
    }

    /// Run one control step over a measurement window of `elapsed`
    ///
    /// Returns the new bitrate if it was applied.
    pub fn adjust_once(&self, elapsed: Duration) -> Option<u32> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }

        let (applied, encoder) = {
            let mut state = self.state.lock();
            let bytes: u64 = state.traffic.values().sum();
            state.traffic.clear();

            let data_usage_bps = (bytes * 8) as f64 / secs;
            let min = self.config.min_video_bitrate as f64;
            let max = self.config.max_video_bitrate as f64;

            let remaining = (self.config.total_bandwidth as f64 - data_usage_bps).max(min);
            let target = remaining.min(max);

            let k = self.config.quality_adjust_sensitivity;
            let current = state.current_video_bitrate as f64;
            let new = (current * (1.0 - k) + target * k).clamp(min, max).round();

            let change = (new - current).abs() / current;
            if change <= HYSTERESIS {
                debug!(
                    data_usage_bps = data_usage_bps as u64,
                    bitrate_bps = state.current_video_bitrate,
                    candidate_bps = new as u64,
                    "Bitrate change within hysteresis, keeping current"
                );
                return None;
            }

            let new = new as u32;
            state.current_video_bitrate = new;
            state.current_data_bandwidth = data_share(&self.config, new);
            info!(
                data_usage_bps = data_usage_bps as u64,
                old_bitrate_bps = current as u64,
                bitrate_bps = new,
                "Adjusted video bitrate"
            );
            (new, state.encoder.clone())
        };

        match encoder {
            EncoderSlot::Adjustable(control) => {
                if let Err(e) = control.set_bitrate(applied) {
                    warn!("Failed to update encoder bitrate: {}", e);
                }
            }
            EncoderSlot::Fixed | EncoderSlot::Unregistered => {}
        }
        Some(applied)
    }

    /// Start the periodic control loop. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }

        let done = DoneSignal::new();
        let period = self.config.adjust_interval();
        let manager = Arc::clone(self);
        let stop = done.clone();

        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = stop.closed() => break,
                    _ = interval.tick() => {
                        manager.adjust_once(period);
                    }
                }
            }
            debug!("Bandwidth manager stopped");
        });

        info!(
            interval_ms = period.as_millis() as u64,
            bitrate_bps = self.current_video_bitrate(),
            "Bandwidth manager started"
        );
        *ticker = Some((done, handle));
    }

    pub fn stop(&self) {
        if let Some((done, _handle)) = self.ticker.lock().take() {
            done.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().is_some()
    }
}

impl Drop for BandwidthManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn data_share(config: &BandwidthConfig, video_bitrate: u32) -> u32 {
    config
        .total_bandwidth
        .saturating_sub(video_bitrate)
        .max(config.min_data_channel_bandwidth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingEncoder {
        last: AtomicU32,
    }

    impl BitrateControl for RecordingEncoder {
        fn set_bitrate(&self, bitrate_bps: u32) -> Result<()> {
            self.last.store(bitrate_bps, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_defaults() {
        let manager = BandwidthManager::new(BandwidthConfig::default());
        assert_eq!(manager.current_video_bitrate(), 5_000_000);
        assert_eq!(manager.current_data_bandwidth(), 5_000_000);
    }

    #[test]
    fn test_idle_data_channel_moves_toward_max() {
        let manager = BandwidthManager::new(BandwidthConfig::default());
        let applied = manager.adjust_once(Duration::from_secs(2));
        // 5_000_000 + (8_000_000 - 5_000_000) * 0.3
        assert_eq!(applied, Some(5_900_000));
        assert_eq!(manager.current_video_bitrate(), 5_900_000);
        assert_eq!(manager.current_data_bandwidth(), 4_100_000);
    }

    #[test]
    fn test_small_change_not_applied() {
        let manager = BandwidthManager::new(BandwidthConfig::default());
        manager.set_initial_video_bitrate(7_800_000);
        // target 8M: 7.8M * 0.7 + 8M * 0.3 = 7.86M, under 5%
        assert_eq!(manager.adjust_once(Duration::from_secs(2)), None);
        assert_eq!(manager.current_video_bitrate(), 7_800_000);
    }

    #[test]
    fn test_heavy_data_usage_floors_at_min() {
        let manager = BandwidthManager::new(BandwidthConfig::default());
        manager.set_initial_video_bitrate(520_000);
        // 3 MB over 2 s = 12 Mbps, more than the whole budget
        manager.register_message_traffic("sensor_msgs/msg/LaserScan", 3_000_000);
        assert_eq!(manager.adjust_once(Duration::from_secs(2)), None);
        assert_eq!(manager.current_video_bitrate(), 520_000);

        manager.set_initial_video_bitrate(4_000_000);
        manager.register_message_traffic("sensor_msgs/msg/LaserScan", 3_000_000);
        let applied = manager.adjust_once(Duration::from_secs(2)).unwrap();
        // 4M * 0.7 + 0.5M * 0.3
        assert_eq!(applied, 2_950_000);
    }

    #[test]
    fn test_traffic_counters_reset_each_tick() {
        let manager = BandwidthManager::new(BandwidthConfig::default());
        manager.register_message_traffic("a", 1_000_000);
        manager.register_message_traffic("b", 1_000_000);
        // 16 Mbps of data: 5M * 0.7 + 0.5M * 0.3 = 3.65M
        assert_eq!(manager.adjust_once(Duration::from_secs(1)), Some(3_650_000));
        // Counters are empty again: 3.65M * 0.7 + 8M * 0.3 = 4.955M
        assert_eq!(manager.adjust_once(Duration::from_secs(1)), Some(4_955_000));
    }

    #[test]
    fn test_bitrate_stays_within_bounds() {
        let manager = BandwidthManager::new(BandwidthConfig::default());
        for _ in 0..50 {
            manager.adjust_once(Duration::from_secs(2));
            let bitrate = manager.current_video_bitrate();
            assert!((500_000..=8_000_000).contains(&bitrate));
        }
        manager.set_initial_video_bitrate(u32::MAX);
        assert_eq!(manager.current_video_bitrate(), 8_000_000);
        manager.set_initial_video_bitrate(0);
        assert_eq!(manager.current_video_bitrate(), 500_000);
    }

    #[test]
    fn test_applied_bitrate_pushed_to_encoder() {
        let manager = BandwidthManager::new(BandwidthConfig::default());
        let encoder = Arc::new(RecordingEncoder {
            last: AtomicU32::new(0),
        });
        manager.register_encoder(EncoderSlot::Adjustable(encoder.clone()));

        manager.adjust_once(Duration::from_secs(2));
        assert_eq!(encoder.last.load(Ordering::SeqCst), 5_900_000);
    }

    #[test]
    fn test_fixed_encoder_is_noop() {
        let manager = BandwidthManager::new(BandwidthConfig::default());
        manager.register_encoder(EncoderSlot::Fixed);
        assert_eq!(manager.adjust_once(Duration::from_secs(2)), Some(5_900_000));
    }

    #[tokio::test]
    async fn test_bitrate_watch_delivers_latest() {
        let (control, mut rx) = BitrateWatch::channel(5_000_000);
        control.set_bitrate(6_000_000).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 6_000_000);

        drop(rx);
        assert!(control.set_bitrate(7_000_000).is_err());
    }

    #[tokio::test]
    async fn test_control_loop_ticks() {
        let config = BandwidthConfig {
            adjust_interval_ms: 20,
            ..Default::default()
        };
        let manager = Arc::new(BandwidthManager::new(config));
        manager.start();
        manager.start();
        assert!(manager.is_running());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.current_video_bitrate() > 5_000_000);

        manager.stop();
        assert!(!manager.is_running());
    }
}
