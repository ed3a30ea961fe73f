use crate::ntp::NtpClock;
use chrono::{DateTime, Local, Timelike};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Coarse wait quantum while the target is far away.
const COARSE_SLEEP: Duration = Duration::from_millis(50);
/// Wake this much before the deadline and re-check.
const COARSE_MARGIN_US: i64 = 500;
/// Smallest coarse sleep; below it the loop goes fine-grained.
const MIN_SLEEP_US: i64 = 200;
/// Remaining time at which the fine loop takes over.
const FINE_WINDOW_US: i64 = 2000;
/// Fine-loop nap while more than 200us remain.
const FINE_SLEEP: Duration = Duration::from_micros(100);

fn epoch_us(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(e) => -(e.duration().as_micros() as i64),
    }
}

/// Next wall instant whose minute and second equal `(minute, second)`,
/// strictly after `now` (rolls into the next hour when already past).
pub fn next_wall_target(now: SystemTime, minute: u32, second: u32) -> SystemTime {
    let now_local: DateTime<Local> = now.into();
    let target = now_local
        .with_minute(minute.min(59))
        .and_then(|t| t.with_second(second.min(59)))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now_local);
    let target = if target <= now_local {
        target + chrono::Duration::hours(1)
    } else {
        target
    };
    target.into()
}

struct TimerShared {
    clock: Arc<NtpClock>,
    /// Signed: positive fires later, negative earlier. Re-read every wait
    /// iteration so edits apply up to the instant of firing.
    latency_comp_us: AtomicI64,
    /// Token of the armed schedule; zero when nothing is armed. A worker
    /// only fires while its own token is still the active one.
    active_token: AtomicU64,
    token_counter: AtomicU64,
    /// Raw target (without compensation), epoch microseconds; 0 = none.
    target_epoch_us: AtomicI64,
}

/// One-shot scheduled start aligned to the NTP clock. Arming spawns a
/// transient worker; cancellation bumps the token and the worker exits
/// without firing on its next check.
pub struct StartTimer {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StartTimer {
    pub fn new(clock: Arc<NtpClock>) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                clock,
                latency_comp_us: AtomicI64::new(0),
                active_token: AtomicU64::new(0),
                token_counter: AtomicU64::new(0),
                target_epoch_us: AtomicI64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn set_latency_comp_us(&self, micros: i64) {
        self.shared.latency_comp_us.store(micros, Ordering::Relaxed);
    }

    pub fn latency_comp_us(&self) -> i64 {
        self.shared.latency_comp_us.load(Ordering::Relaxed)
    }

    pub fn is_armed(&self) -> bool {
        self.shared.active_token.load(Ordering::SeqCst) != 0
    }

    /// Raw target of the armed schedule, if any.
    pub fn armed_target(&self) -> Option<SystemTime> {
        let us = self.shared.target_epoch_us.load(Ordering::SeqCst);
        (us != 0).then(|| UNIX_EPOCH + Duration::from_micros(us as u64))
    }

    /// Arm at the next wall instant matching `(minute, second)` on the NTP
    /// clock. Returns the raw target. Re-arming replaces any armed
    /// schedule.
    pub fn arm<F>(&self, minute: u32, second: u32, on_fire: F) -> SystemTime
    where
        F: FnOnce() + Send + 'static,
    {
        if minute > 59 || second > 59 {
            warn!("schedule target {:02}:{:02} clamped", minute, second);
        }
        let target = next_wall_target(self.shared.clock.now(), minute, second);
        self.arm_at(target, on_fire);
        target
    }

    /// Arm at an absolute wall-clock instant.
    pub fn arm_at<F>(&self, target: SystemTime, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.shared.token_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.active_token.store(token, Ordering::SeqCst);
        let target_us = epoch_us(target);
        self.shared.target_epoch_us.store(target_us, Ordering::SeqCst);

        info!(
            "scheduled start armed for {:?} (synced: {})",
            DateTime::<Local>::from(target),
            self.shared.clock.is_synced()
        );

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("keyharp-schedule".into())
            .spawn(move || run_schedule(shared, token, target_us, on_fire))
            .expect("failed to spawn schedule worker");

        // A replaced worker already sees a stale token; just keep the
        // newest handle for a best-effort join on drop.
        let Ok(mut worker) = self.worker.lock() else {
            warn!("schedule worker handle lock poisoned, worker left detached");
            return;
        };
        *worker = Some(handle);
    }

    /// Disarm. Any in-flight worker observes the token change and exits
    /// without firing.
    pub fn cancel(&self) {
        if self.shared.active_token.swap(0, Ordering::SeqCst) != 0 {
            info!("scheduled start cancelled");
        }
        self.shared.target_epoch_us.store(0, Ordering::SeqCst);
    }
}

impl Drop for StartTimer {
    fn drop(&mut self) {
        self.cancel();
        let Ok(mut worker) = self.worker.lock() else {
            return;
        };
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
    }
}

fn run_schedule<F: FnOnce()>(shared: Arc<TimerShared>, token: u64, target_us: i64, on_fire: F) {
    loop {
        if shared.active_token.load(Ordering::SeqCst) != token {
            debug!("schedule worker superseded before firing");
            return;
        }

        let now_us = epoch_us(shared.clock.now());
        let effective_us = target_us + shared.latency_comp_us.load(Ordering::Relaxed);
        let remaining = effective_us - now_us;
        if remaining <= 0 {
            break;
        }

        if remaining > FINE_WINDOW_US {
            let sleep_us = (remaining - COARSE_MARGIN_US)
                .min(COARSE_SLEEP.as_micros() as i64)
                .max(MIN_SLEEP_US);
            spin_sleep::sleep(Duration::from_micros(sleep_us as u64));
            continue;
        }

        // Fine loop: the last two milliseconds.
        loop {
            if shared.active_token.load(Ordering::SeqCst) != token {
                debug!("schedule worker superseded in fine wait");
                return;
            }
            let now_us = epoch_us(shared.clock.now());
            let effective_us = target_us + shared.latency_comp_us.load(Ordering::Relaxed);
            let fine_remaining = effective_us - now_us;
            if fine_remaining <= 0 {
                break;
            }
            if fine_remaining > 200 {
                spin_sleep::sleep(FINE_SLEEP);
            } else {
                thread::yield_now();
            }
        }
        break;
    }

    // Fire exactly once, and only if still the active schedule.
    if shared
        .active_token
        .compare_exchange(token, 0, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        shared.target_epoch_us.store(0, Ordering::SeqCst);
        info!("scheduled start fired");
        on_fire();
    }
}
