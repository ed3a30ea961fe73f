use log::{debug, info, warn};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Fixed server list, tried in order.
const NTP_SERVERS: [&str; 4] = [
    "ntp.aliyun.com",
    "ntp.tencent.com",
    "cn.pool.ntp.org",
    "pool.ntp.org",
];

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_DELTA: i64 = 2_208_988_800;

/// EWMA factor for base-clock adjustments once synced.
const BASE_ALPHA: f64 = 0.2;
/// Largest single smoothed adjustment, milliseconds.
const BASE_STEP_CAP_MS: f64 = 5.0;
/// Errors beyond this hard-reset the base instead of smoothing.
const HARD_RESET_MS: f64 = 5000.0;
/// Minimum anchor age before a skew measurement is trusted.
const SKEW_BASELINE_S: f64 = 60.0;
/// Skew measurements further than this from 1.0 are discarded as jitter.
const SKEW_TOLERANCE: f64 = 1e-3;
/// EWMA factor for skew updates.
const SKEW_ALPHA: f64 = 0.3;

/// Transient sync failures. Never surfaced to callers: the auto-sync loop
/// retries on its own schedule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NtpTransient {
    #[error("no NTP server responded in time")]
    Timeout,
    #[error("no NTP servers reachable")]
    NoServers,
    #[error("no usable samples this round")]
    NoValidSamples,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct NtpSample {
    pub offset_ms: f64,
    pub delay_ms: f64,
}

/// Drop high-delay samples, then combine the survivors with `1/delay^2`
/// weights. Returns `(offset_ms, delay_ms)`.
pub(crate) fn filter_and_weight(samples: &[NtpSample]) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let min_delay = samples
        .iter()
        .map(|s| s.delay_ms)
        .fold(f64::INFINITY, f64::min);
    let threshold = (min_delay * 1.5).max(min_delay + 10.0);

    let mut total_weight = 0.0;
    let mut offset_sum = 0.0;
    let mut delay_sum = 0.0;
    for s in samples.iter().filter(|s| s.delay_ms <= threshold) {
        let weight = 1.0 / (s.delay_ms * s.delay_ms);
        total_weight += weight;
        offset_sum += s.offset_ms * weight;
        delay_sum += s.delay_ms * weight;
    }
    if total_weight <= 0.0 {
        return None;
    }
    Some((offset_sum / total_weight, delay_sum / total_weight))
}

fn epoch_ms(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64() * 1000.0,
        Err(e) => -e.duration().as_secs_f64() * 1000.0,
    }
}

fn from_epoch_ms(ms: f64) -> SystemTime {
    if ms >= 0.0 {
        UNIX_EPOCH + Duration::from_secs_f64(ms / 1000.0)
    } else {
        UNIX_EPOCH - Duration::from_secs_f64(-ms / 1000.0)
    }
}

/// 48-byte SNTP v3 client request: LI=0, VN=3, Mode=3.
fn client_packet() -> [u8; 48] {
    let mut packet = [0u8; 48];
    packet[0] = 0x1B;
    packet
}

/// Decode a 64-bit NTP timestamp (seconds since 1900 + 32-bit fraction)
/// into Unix epoch milliseconds.
fn decode_timestamp(bytes: &[u8]) -> f64 {
    let seconds = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64;
    let fraction = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as f64;
    ((seconds - NTP_UNIX_DELTA) as f64 + fraction / 4294967296.0) * 1000.0
}

/// Where the base clock lands after `steady_elapsed_s` seconds of monotonic
/// time at the given skew.
fn projected_ms(base_ms: f64, steady_elapsed_s: f64, skew: f64) -> f64 {
    base_ms + steady_elapsed_s * 1000.0 * skew
}

/// One request/response round against a single server.
fn sample_server(server: &str, timeout: Duration) -> std::io::Result<NtpSample> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(timeout))?;
    socket.connect((server, 123))?;

    let packet = client_packet();
    let t0 = epoch_ms(SystemTime::now());
    socket.send(&packet)?;

    let mut buf = [0u8; 48];
    let n = socket.recv(&mut buf)?;
    let t3 = epoch_ms(SystemTime::now());
    if n < 48 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "short NTP response",
        ));
    }

    let t1 = decode_timestamp(&buf[32..40]); // receive timestamp
    let t2 = decode_timestamp(&buf[40..48]); // transmit timestamp

    let offset_ms = ((t1 - t0) + (t2 - t3)) / 2.0;
    let delay_ms = (t3 - t0) - (t2 - t1);
    if !offset_ms.is_finite() || !delay_ms.is_finite() || delay_ms < 0.0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "non-finite NTP sample",
        ));
    }
    Ok(NtpSample {
        offset_ms,
        delay_ms,
    })
}

struct ClockState {
    base_ntp_ms: f64,
    base_steady: Instant,
    skew: f64,
    anchor_ntp_ms: f64,
    anchor_steady: Instant,
    anchor_valid: bool,
}

struct NtpInner {
    state: Mutex<ClockState>,
    synced: AtomicBool,
    last_delay_ms: AtomicI64,
    last_offset_ms: AtomicI64,
    sync_count: AtomicU32,
    stop: AtomicBool,
    wake: Condvar,
    wake_mutex: Mutex<()>,
    auto_running: AtomicBool,
}

/// Skew-corrected wall clock fed by SNTP. `now()` falls back to the host
/// clock until the first successful sync.
pub struct NtpClock {
    inner: Arc<NtpInner>,
    auto_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for NtpClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NtpClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(NtpInner {
                state: Mutex::new(ClockState {
                    base_ntp_ms: 0.0,
                    base_steady: now,
                    skew: 1.0,
                    anchor_ntp_ms: 0.0,
                    anchor_steady: now,
                    anchor_valid: false,
                }),
                synced: AtomicBool::new(false),
                last_delay_ms: AtomicI64::new(0),
                last_offset_ms: AtomicI64::new(0),
                sync_count: AtomicU32::new(0),
                stop: AtomicBool::new(false),
                wake: Condvar::new(),
                wake_mutex: Mutex::new(()),
                auto_running: AtomicBool::new(false),
            }),
            auto_thread: Mutex::new(None),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    pub fn last_delay_ms(&self) -> i64 {
        self.inner.last_delay_ms.load(Ordering::Relaxed)
    }

    pub fn last_offset_ms(&self) -> i64 {
        self.inner.last_offset_ms.load(Ordering::Relaxed)
    }

    pub fn sync_count(&self) -> u32 {
        self.inner.sync_count.load(Ordering::Relaxed)
    }

    /// Current best estimate of true wall time. Monotonic within the
    /// process as long as the monotonic source is.
    pub fn now(&self) -> SystemTime {
        self.inner.now()
    }

    /// Run one full sync attempt against the server list. Blocking; the
    /// auto-sync thread is the usual caller.
    pub fn sync(&self) -> Result<f64, NtpTransient> {
        self.inner.sync()
    }

    /// Start the background sync loop: every second until the clock settles
    /// (first three successes), every ten seconds after.
    pub fn start_auto_sync(&self) {
        if self.inner.auto_running.swap(true, Ordering::SeqCst) {
            return;
        }
        // Restart always re-enters the fast warm-up phase.
        self.inner.sync_count.store(0, Ordering::Relaxed);
        self.inner.stop.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("keyharp-ntp".into())
            .spawn(move || {
                debug!("NTP auto-sync thread started");
                while !inner.stop.load(Ordering::SeqCst) {
                    match inner.sync() {
                        Ok(offset) => debug!("NTP sync ok, offset {:.1}ms", offset),
                        Err(err) => debug!("NTP sync failed: {}", err),
                    }

                    let interval = sync_interval(
                        inner.sync_count.load(Ordering::Relaxed),
                        inner.synced.load(Ordering::Acquire),
                    );
                    let Ok(guard) = inner.wake_mutex.lock() else {
                        warn!("NTP wake lock poisoned, stopping auto-sync");
                        break;
                    };
                    let _ = inner
                        .wake
                        .wait_timeout_while(guard, interval, |_| {
                            !inner.stop.load(Ordering::SeqCst)
                        });
                }
                inner.auto_running.store(false, Ordering::SeqCst);
                debug!("NTP auto-sync thread exited");
            })
            .expect("failed to spawn NTP sync thread");
        let Ok(mut slot) = self.auto_thread.lock() else {
            warn!("NTP thread handle lock poisoned, sync thread left detached");
            return;
        };
        *slot = Some(handle);
    }

    /// Cooperative stop: signal the loop and join it.
    pub fn stop_auto_sync(&self) {
        if !self.inner.auto_running.load(Ordering::SeqCst) {
            return;
        }
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
        let Ok(mut slot) = self.auto_thread.lock() else {
            warn!("NTP thread handle lock poisoned, skipping join");
            return;
        };
        if let Some(handle) = slot.take() {
            let _ = handle.join();
        }
    }

    /// Shutdown for process exit: signal, give the thread a short grace to
    /// notice, then detach rather than block on an in-flight request.
    pub fn force_shutdown(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
        let handle = match self.auto_thread.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                warn!("NTP thread handle lock poisoned, sync thread left detached");
                None
            }
        };
        if let Some(handle) = handle {
            thread::sleep(Duration::from_millis(50));
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                drop(handle);
                warn!("NTP sync thread detached at shutdown");
            }
        }
        self.inner.synced.store(false, Ordering::Release);
    }
}

impl Drop for NtpClock {
    fn drop(&mut self) {
        self.force_shutdown();
    }
}

fn sync_interval(count: u32, synced: bool) -> Duration {
    if count <= 3 || !synced {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(10)
    }
}

impl NtpInner {
    fn now(&self) -> SystemTime {
        if !self.synced.load(Ordering::Acquire) {
            return SystemTime::now();
        }
        let Ok(state) = self.state.lock() else {
            warn!("NTP clock state lock poisoned, falling back to host time");
            return SystemTime::now();
        };
        let (base_ms, base_steady, skew) = (state.base_ntp_ms, state.base_steady, state.skew);
        drop(state);
        let elapsed = base_steady.elapsed().as_secs_f64();
        from_epoch_ms(projected_ms(base_ms, elapsed, skew))
    }

    fn sync(&self) -> Result<f64, NtpTransient> {
        // Before the first success, favor latency over sample count.
        let fast_mode = !self.synced.load(Ordering::Acquire);
        let per_server = if fast_mode { 2 } else { 8 };
        let timeout = Duration::from_millis(if fast_mode { 200 } else { 1000 });

        let mut samples: Vec<NtpSample> = Vec::new();
        let mut reachable = false;
        let mut saw_timeout = false;

        'servers: for server in NTP_SERVERS {
            for _ in 0..per_server {
                if self.stop.load(Ordering::SeqCst) {
                    return Err(NtpTransient::NoValidSamples);
                }
                match sample_server(server, timeout) {
                    Ok(sample) => {
                        reachable = true;
                        if sample.delay_ms > 0.0 {
                            samples.push(sample);
                        }
                    }
                    Err(err) => {
                        if matches!(
                            err.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) {
                            saw_timeout = true;
                        }
                        debug!("NTP sample from {} failed: {}", server, err);
                    }
                }
            }
            if fast_mode && samples.len() >= 3 {
                break 'servers;
            }
        }

        if samples.is_empty() {
            // A server replied but every sample was unusable; a server
            // accepted the request but never answered; or nothing was
            // reachable at all (DNS/socket failures).
            return Err(if reachable {
                NtpTransient::NoValidSamples
            } else if saw_timeout {
                NtpTransient::Timeout
            } else {
                NtpTransient::NoServers
            });
        }

        let (final_offset, final_delay) =
            filter_and_weight(&samples).ok_or(NtpTransient::NoValidSamples)?;

        let steady_now = Instant::now();
        let local_now_ms = epoch_ms(SystemTime::now());
        let now_est_ms = local_now_ms + final_offset;
        let current_ms = epoch_ms(self.now());
        let error_ms = now_est_ms - current_ms;

        let was_synced = self.synced.load(Ordering::Acquire);
        let count = self.sync_count.load(Ordering::Relaxed);

        {
            let Ok(mut state) = self.state.lock() else {
                warn!("NTP clock state lock poisoned, discarding sync round");
                return Err(NtpTransient::NoValidSamples);
            };

            // Skew first: it compares against the pre-update base. The
            // anchor keeps moving through the warm-up syncs, then freezes
            // to give the slope a long baseline.
            if !was_synced || !state.anchor_valid || error_ms.abs() > HARD_RESET_MS || count < 5 {
                state.anchor_ntp_ms = now_est_ms;
                state.anchor_steady = steady_now;
                state.anchor_valid = true;
                state.skew = 1.0;
            } else {
                let steady_delta_s = steady_now
                    .duration_since(state.anchor_steady)
                    .as_secs_f64();
                if steady_delta_s > SKEW_BASELINE_S {
                    let real_delta_s = (now_est_ms - state.anchor_ntp_ms) / 1000.0;
                    let measured = real_delta_s / steady_delta_s;
                    if (measured - 1.0).abs() < SKEW_TOLERANCE {
                        state.skew = state.skew * (1.0 - SKEW_ALPHA) + measured * SKEW_ALPHA;
                    }
                }
            }

            if !was_synced || error_ms.abs() > HARD_RESET_MS {
                state.base_ntp_ms = now_est_ms;
            } else {
                let adjust = (error_ms * BASE_ALPHA).clamp(-BASE_STEP_CAP_MS, BASE_STEP_CAP_MS);
                state.base_ntp_ms = current_ms + adjust;
            }
            state.base_steady = steady_now;
        }

        self.synced.store(true, Ordering::Release);
        self.sync_count.fetch_add(1, Ordering::Relaxed);
        self.last_delay_ms
            .store(final_delay.round() as i64, Ordering::Relaxed);
        self.last_offset_ms
            .store(final_offset.round() as i64, Ordering::Relaxed);

        if !was_synced {
            info!(
                "NTP clock synced: offset {:.1}ms, delay {:.1}ms",
                final_offset, final_delay
            );
        }
        Ok(final_offset)
    }
}
