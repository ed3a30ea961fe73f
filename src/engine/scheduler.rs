use crate::engine::builder::{BuildInput, EventBuilder, EventKind, TimedEvent};
use crate::engine::KeySink;
use crate::model::config::{
    validate_channel, validate_pitch_range, validate_speed, ChannelConfig, GlobalConfig,
    WindowId, CHANNEL_COUNT, MAX_TRANSPOSE, MIN_TRANSPOSE,
};
use crate::model::keymap::KeyMap;
use crate::model::song::{RawNote, Song};
use log::{debug, info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Worker wakes at least this often while playing so position reads stay
/// fresh for UI-style polling.
const MAX_SLEEP_S: f64 = 0.015;
/// Below this the OS sleep granularity is not trustworthy: spin instead.
const SPIN_THRESHOLD_S: f64 = 0.002;
/// Slice shaved off bulk sleeps and finished by spinning.
const SLEEP_SLACK_NS: u32 = 1_500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Ready,
    Playing,
    Paused,
}

struct EngineState {
    song: Option<Arc<Song>>,
    /// All notes of the current song, sorted by start time.
    notes: Vec<RawNote>,
    histograms: Vec<[u32; 128]>,
    length_s: f64,
    channels: [ChannelConfig; CHANNEL_COUNT],
    global: GlobalConfig,
    keymap: KeyMap,
    playing: bool,
    paused: bool,
    seek_pending: bool,
    current_time_s: f64,
    config_version: u32,
    built_version: u32,
    /// Every Down not yet matched by its Up, released on pause/stop/seek.
    active_keys: Vec<(u32, Option<WindowId>)>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            song: None,
            notes: Vec::new(),
            histograms: Vec::new(),
            length_s: 0.0,
            channels: [ChannelConfig::default(); CHANNEL_COUNT],
            global: GlobalConfig::default(),
            keymap: KeyMap::default(),
            playing: false,
            paused: false,
            seek_pending: false,
            current_time_s: 0.0,
            config_version: 1,
            built_version: 0,
            active_keys: Vec::new(),
        }
    }

    fn touch(&mut self) {
        self.config_version = self.config_version.wrapping_add(1);
    }

    /// Release every held key through the sink, newest first, then fire the
    /// modifier safety batch.
    fn release_all_keys(&mut self, sink: &dyn KeySink) {
        if self.active_keys.is_empty() {
            return;
        }
        debug!("releasing {} held keys", self.active_keys.len());
        for (key, window) in self.active_keys.drain(..).rev() {
            sink.release(key, crate::model::config::Modifier::None, window);
        }
        sink.release_modifiers();
    }
}

struct Shared {
    state: Mutex<EngineState>,
    cv: Condvar,
    running: AtomicBool,
}

/// Owns the dedicated playback worker. The public methods mutate shared
/// state under one mutex and wake the worker through a condition variable;
/// none of them blocks on playback and none of them fails: invalid settings
/// are clamped or ignored with a warning.
pub struct Scheduler {
    shared: Arc<Shared>,
    sink: Arc<dyn KeySink>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(sink: Arc<dyn KeySink>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState::new()),
            cv: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_sink = Arc::clone(&sink);
        let handle = thread::Builder::new()
            .name("keyharp-playback".into())
            .spawn(move || worker_loop(worker_shared, worker_sink))
            .expect("failed to spawn playback worker");

        info!("playback scheduler started");
        Self {
            shared,
            sink,
            worker: Mutex::new(Some(handle)),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, EngineState>> {
        let Ok(state) = self.shared.state.lock() else {
            warn!("scheduler state lock poisoned, ignoring operation");
            return None;
        };
        Some(state)
    }

    /// Replace the current file. Playback stops, the clock resets and the
    /// event stream is rebuilt on the worker.
    pub fn load(&self, song: Song) {
        let Some(mut state) = self.lock() else {
            return;
        };
        state.playing = false;
        state.paused = false;
        state.current_time_s = 0.0;
        state.release_all_keys(self.sink.as_ref());

        let mut notes: Vec<RawNote> = song.notes_by_track.iter().flatten().copied().collect();
        notes.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));

        let mut histograms = vec![[0u32; 128]; song.tracks.len()];
        for note in &notes {
            if (0..128).contains(&note.pitch) {
                if let Some(hist) = histograms.get_mut(note.track_index.max(0) as usize) {
                    hist[note.pitch as usize] += 1;
                }
            }
        }

        info!(
            "loaded song: {} tracks, {} notes, {:.1}s",
            song.tracks.len(),
            notes.len(),
            song.length_s
        );

        state.length_s = song.length_s as f64;
        state.notes = notes;
        state.histograms = histograms;
        state.song = Some(Arc::new(song));
        state.touch();
        drop(state);
        self.shared.cv.notify_all();
    }

    pub fn play(&self) {
        let Some(mut state) = self.lock() else {
            return;
        };
        state.playing = true;
        state.paused = false;
        drop(state);
        self.shared.cv.notify_all();
        info!("playback started");
    }

    pub fn pause(&self) {
        let Some(mut state) = self.lock() else {
            return;
        };
        state.paused = true;
        state.release_all_keys(self.sink.as_ref());
        info!("playback paused at {:.3}s", state.current_time_s);
    }

    pub fn stop(&self) {
        let Some(mut state) = self.lock() else {
            return;
        };
        state.playing = false;
        state.paused = false;
        state.current_time_s = 0.0;
        state.release_all_keys(self.sink.as_ref());
        info!("playback stopped");
    }

    pub fn seek(&self, time_s: f64) {
        let Some(mut state) = self.lock() else {
            return;
        };
        let clamped = time_s.clamp(0.0, state.length_s);
        state.current_time_s = clamped;
        state.seek_pending = true;
        state.release_all_keys(self.sink.as_ref());
        debug!("seek to {:.3}s", clamped);
        drop(state);
        self.shared.cv.notify_all();
    }

    pub fn set_speed(&self, speed: f64) {
        if let Err(err) = validate_speed(speed) {
            warn!("ignoring speed change: {}", err);
            return;
        }
        let Some(mut state) = self.lock() else {
            return;
        };
        if state.global.speed != speed {
            state.global.speed = speed;
            state.touch();
            drop(state);
            self.shared.cv.notify_all();
        }
    }

    pub fn set_channel_enabled(&self, channel: usize, enabled: bool) {
        self.update_channel(channel, |ch| ch.enabled = enabled);
    }

    pub fn set_channel_transpose(&self, channel: usize, semitones: i32) {
        let clamped = semitones.clamp(MIN_TRANSPOSE, MAX_TRANSPOSE);
        if clamped != semitones {
            warn!(
                "transpose {} out of range, clamped to {}",
                semitones, clamped
            );
        }
        self.update_channel(channel, |ch| ch.transpose_semitones = clamped);
    }

    pub fn set_channel_window(&self, channel: usize, window: Option<WindowId>) {
        self.update_channel(channel, |ch| ch.window = window);
    }

    pub fn set_channel_track(&self, channel: usize, track_filter: i32) {
        self.update_channel(channel, |ch| ch.track_filter = track_filter.max(-1));
    }

    fn update_channel(&self, channel: usize, apply: impl FnOnce(&mut ChannelConfig)) {
        if let Err(err) = validate_channel(channel) {
            warn!("ignoring channel update: {}", err);
            return;
        }
        let Some(mut state) = self.lock() else {
            return;
        };
        let before = state.channels[channel];
        apply(&mut state.channels[channel]);
        if state.channels[channel] != before {
            state.touch();
            drop(state);
            self.shared.cv.notify_all();
        }
    }

    pub fn set_pitch_range(&self, min_pitch: i32, max_pitch: i32) {
        if let Err(err) = validate_pitch_range(min_pitch, max_pitch) {
            warn!("ignoring pitch range change: {}", err);
            return;
        }
        let Some(mut state) = self.lock() else {
            return;
        };
        if (state.global.min_pitch, state.global.max_pitch) != (min_pitch, max_pitch) {
            state.global.min_pitch = min_pitch;
            state.global.max_pitch = max_pitch;
            state.touch();
            drop(state);
            self.shared.cv.notify_all();
        }
    }

    pub fn set_decompose(&self, decompose: bool) {
        let Some(mut state) = self.lock() else {
            return;
        };
        if state.global.decompose != decompose {
            state.global.decompose = decompose;
            state.touch();
            drop(state);
            self.shared.cv.notify_all();
        }
    }

    pub fn set_note_map(&self, keymap: KeyMap) {
        let Some(mut state) = self.lock() else {
            return;
        };
        if state.keymap != keymap {
            state.keymap = keymap;
            state.touch();
            drop(state);
            self.shared.cv.notify_all();
        }
    }

    pub fn note_map(&self) -> KeyMap {
        self.lock().map(|s| s.keymap.clone()).unwrap_or_default()
    }

    pub fn channel(&self, channel: usize) -> Option<ChannelConfig> {
        self.lock().and_then(|s| s.channels.get(channel).copied())
    }

    pub fn global_config(&self) -> GlobalConfig {
        self.lock().map(|s| s.global).unwrap_or_default()
    }

    pub fn song(&self) -> Option<Arc<Song>> {
        self.lock().and_then(|s| s.song.clone())
    }

    pub fn status(&self) -> PlaybackStatus {
        let Some(state) = self.lock() else {
            return PlaybackStatus::Idle;
        };
        if state.song.is_none() {
            PlaybackStatus::Idle
        } else if state.paused {
            PlaybackStatus::Paused
        } else if state.playing {
            PlaybackStatus::Playing
        } else {
            PlaybackStatus::Ready
        }
    }

    pub fn current_time_s(&self) -> f64 {
        self.lock().map(|s| s.current_time_s).unwrap_or(0.0)
    }

    pub fn length_s(&self) -> f64 {
        self.lock().map(|s| s.length_s).unwrap_or(0.0)
    }

    /// True once every event of the loaded song has been dispatched.
    pub fn is_finished(&self) -> bool {
        let Some(state) = self.lock() else {
            return true;
        };
        state.song.is_some() && state.current_time_s >= state.length_s
    }

    /// Stop the worker and join it. The worker releases any held keys
    /// before exiting. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.cv.notify_all();
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => {
                warn!("worker handle lock poisoned, skipping join");
                None
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("playback worker panicked");
            }
        }
        info!("playback scheduler shut down");
    }

    #[cfg(test)]
    fn debug_counts(&self) -> (u32, u32, usize) {
        self.lock()
            .map(|state| {
                (
                    state.config_version,
                    state.built_version,
                    state.active_keys.len(),
                )
            })
            .unwrap_or((u32::MAX, 0, usize::MAX))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn rebuild_events(builder: &mut EventBuilder, state: &EngineState) {
    builder.rebuild(&BuildInput {
        notes: &state.notes,
        histograms: &state.histograms,
        global: &state.global,
        channels: &state.channels,
        keymap: &state.keymap,
        live_playing: state.playing,
    });
}

/// First index whose event time is at or after `time_s`.
fn resync_index(events: &[TimedEvent], time_s: f64) -> usize {
    events.partition_point(|e| e.time_s < time_s)
}

fn worker_loop(shared: Arc<Shared>, sink: Arc<dyn KeySink>) {
    #[cfg(windows)]
    let _hints = crate::engine::windows::configure_worker_thread();

    let sleeper = SpinSleeper::new(SLEEP_SLACK_NS).with_spin_strategy(SpinStrategy::YieldThread);
    let mut builder = EventBuilder::new();
    let mut next_idx: usize = 0;
    let mut last_tick = Instant::now();

    loop {
        let Ok(mut state) = shared.state.lock() else {
            warn!("playback worker: state lock poisoned, exiting");
            break;
        };
        if !shared.running.load(Ordering::SeqCst) {
            state.release_all_keys(sink.as_ref());
            break;
        }

        if state.config_version != state.built_version {
            rebuild_events(&mut builder, &state);
            state.built_version = state.config_version;
            next_idx = resync_index(builder.events(), state.current_time_s);
        }

        // Block until there is something to do. Each wake re-checks the
        // configuration and re-finds the dispatch position.
        while shared.running.load(Ordering::SeqCst) && (!state.playing || state.paused) {
            state = match shared.cv.wait(state) {
                Ok(guard) => guard,
                Err(_) => {
                    warn!("playback worker: state lock poisoned during wait, exiting");
                    return;
                }
            };
            last_tick = Instant::now();
            if state.config_version != state.built_version {
                rebuild_events(&mut builder, &state);
                state.built_version = state.config_version;
            }
            next_idx = resync_index(builder.events(), state.current_time_s);
        }
        if !shared.running.load(Ordering::SeqCst) {
            state.release_all_keys(sink.as_ref());
            break;
        }

        if state.seek_pending {
            state.seek_pending = false;
            next_idx = resync_index(builder.events(), state.current_time_s);
        }

        // Advance the virtual clock by scaled real elapsed time. The cap
        // covers the first iteration after a long-idle wake.
        let now = Instant::now();
        let dt = now.duration_since(last_tick).as_secs_f64().min(0.25);
        last_tick = now;
        state.current_time_s += dt * state.global.speed;

        // Dispatch everything due. Sink calls are fire-and-forget.
        let events = builder.events();
        while next_idx < events.len() && events[next_idx].time_s <= state.current_time_s {
            let event = events[next_idx];
            match event.kind {
                EventKind::Down => {
                    sink.press(event.key_code, event.modifier, event.window);
                    state.active_keys.push((event.key_code, event.window));
                }
                EventKind::Up => {
                    sink.release(event.key_code, event.modifier, event.window);
                    let pair = (event.key_code, event.window);
                    if let Some(pos) = state.active_keys.iter().rposition(|k| *k == pair) {
                        state.active_keys.swap_remove(pos);
                    }
                }
            }
            next_idx += 1;
        }

        // Dynamic sleep: at most the UI tick, at least until the next event.
        let mut sleep_s = MAX_SLEEP_S;
        if next_idx < events.len() {
            let gap = events[next_idx].time_s - state.current_time_s;
            sleep_s = if gap > 0.0 {
                sleep_s.min(gap / state.global.speed)
            } else {
                0.0
            };
        }
        drop(state);

        if sleep_s >= SPIN_THRESHOLD_S {
            // Bulk sleep with a spun tail to ride out timer granularity.
            sleeper.sleep(Duration::from_secs_f64(sleep_s));
        } else if sleep_s > 0.0 {
            let spin_start = Instant::now();
            while spin_start.elapsed() < Duration::from_secs_f64(sleep_s) {
                thread::yield_now();
            }
        } else {
            thread::yield_now();
        }
    }

    debug!("playback worker exited");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::test_sink::{RecordingSink, SinkCall};
    use crate::model::song::Track;

    fn song_with_notes(notes: Vec<RawNote>) -> Song {
        let length = notes
            .iter()
            .map(|n| n.end_s())
            .fold(0.0f32, f32::max);
        Song {
            tracks: vec![Track {
                name: "Test".into(),
                note_count: notes.len(),
            }],
            notes_by_track: vec![notes],
            length_s: length,
            ..Song::default()
        }
    }

    fn note(start: f32, duration: f32, pitch: i32) -> RawNote {
        RawNote {
            start_s: start,
            duration_s: duration,
            pitch,
            track_index: 0,
            channel: 1,
        }
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn dispatches_events_in_order() {
        env_logger::try_init().unwrap_or(());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(sink.clone());

        scheduler.load(song_with_notes(vec![note(0.0, 0.02, 60), note(0.04, 0.02, 62)]));
        scheduler.play();

        assert!(wait_until(2000, || scheduler.is_finished()));
        scheduler.shutdown();

        let calls = sink.take();
        let significant: Vec<&SinkCall> = calls
            .iter()
            .filter(|c| !matches!(c, SinkCall::ReleaseModifiers))
            .collect();
        assert_eq!(significant.len(), 4);
        assert!(matches!(significant[0], SinkCall::Press(q, _, None) if *q == 'Q' as u32));
        assert!(matches!(significant[1], SinkCall::Release(q, _, None) if *q == 'Q' as u32));
        assert!(matches!(significant[2], SinkCall::Press(w, _, None) if *w == 'W' as u32));
        assert!(matches!(significant[3], SinkCall::Release(w, _, None) if *w == 'W' as u32));
    }

    #[test]
    fn pause_releases_held_keys() {
        env_logger::try_init().unwrap_or(());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(sink.clone());

        scheduler.load(song_with_notes(vec![note(0.0, 30.0, 60)]));
        scheduler.play();

        // Wait for the Down to land.
        assert!(wait_until(2000, || sink.saw_press()));

        scheduler.pause();
        assert_eq!(scheduler.status(), PlaybackStatus::Paused);
        let (_, _, active) = scheduler.debug_counts();
        assert_eq!(active, 0);

        let calls = sink.take();
        assert!(calls
            .iter()
            .any(|c| matches!(c, SinkCall::Release(q, _, None) if *q == 'Q' as u32)));
        assert!(calls
            .iter()
            .any(|c| matches!(c, SinkCall::ReleaseModifiers)));
        scheduler.shutdown();
    }

    #[test]
    fn stop_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(sink.clone());
        scheduler.load(song_with_notes(vec![note(0.0, 1.0, 60)]));
        scheduler.play();
        thread::sleep(Duration::from_millis(30));

        scheduler.stop();
        let time_after_first = scheduler.current_time_s();
        let (_, _, active_first) = scheduler.debug_counts();
        scheduler.stop();
        let time_after_second = scheduler.current_time_s();
        let (_, _, active_second) = scheduler.debug_counts();

        assert_eq!(time_after_first, 0.0);
        assert_eq!(time_after_second, 0.0);
        assert_eq!(active_first, 0);
        assert_eq!(active_second, 0);
        assert_eq!(scheduler.status(), PlaybackStatus::Ready);
        scheduler.shutdown();
    }

    #[test]
    fn seek_is_idempotent_and_clamped() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(sink.clone());
        scheduler.load(song_with_notes(vec![note(0.0, 2.0, 60)]));

        scheduler.seek(1.25);
        scheduler.seek(1.25);
        assert!((scheduler.current_time_s() - 1.25).abs() < 1e-9);

        scheduler.seek(100.0);
        assert!((scheduler.current_time_s() - 2.0).abs() < 1e-9);
        scheduler.seek(-3.0);
        assert_eq!(scheduler.current_time_s(), 0.0);
        scheduler.shutdown();
    }

    #[test]
    fn load_resets_clock_and_triggers_rebuild() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(sink.clone());
        scheduler.load(song_with_notes(vec![note(0.0, 1.0, 60)]));
        scheduler.seek(0.5);
        let (version_before, _, _) = scheduler.debug_counts();

        scheduler.load(song_with_notes(vec![note(0.0, 1.0, 62)]));
        assert_eq!(scheduler.current_time_s(), 0.0);
        let (version_after, _, _) = scheduler.debug_counts();
        assert!(version_after > version_before);

        // Worker catches up with the new version.
        assert!(wait_until(2000, || {
            let (config, built, _) = scheduler.debug_counts();
            config == built
        }));
        scheduler.shutdown();
    }

    #[test]
    fn invalid_settings_are_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(sink.clone());

        scheduler.set_speed(0.0);
        scheduler.set_speed(-2.0);
        assert_eq!(scheduler.global_config().speed, 1.0);

        scheduler.set_pitch_range(90, 10);
        let global = scheduler.global_config();
        assert_eq!((global.min_pitch, global.max_pitch), (48, 84));

        scheduler.set_channel_enabled(99, true);
        scheduler.set_channel_transpose(0, 99);
        assert_eq!(scheduler.channel(0).unwrap().transpose_semitones, MAX_TRANSPOSE);
        scheduler.shutdown();
    }

    #[test]
    fn speed_scales_virtual_clock() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(sink.clone());
        scheduler.load(song_with_notes(vec![note(0.0, 10.0, 60)]));
        scheduler.set_speed(4.0);
        scheduler.play();

        thread::sleep(Duration::from_millis(200));
        let t = scheduler.current_time_s();
        scheduler.shutdown();

        // 200ms of wall time at 4x should advance well past 0.4s.
        assert!(t > 0.4, "virtual clock only reached {:.3}s", t);
    }

    #[test]
    fn shutdown_releases_keys_and_joins() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(sink.clone());
        scheduler.load(song_with_notes(vec![note(0.0, 30.0, 60)]));
        scheduler.play();
        assert!(wait_until(2000, || sink.saw_press()));

        scheduler.shutdown();
        let calls = sink.take();
        let presses = calls
            .iter()
            .filter(|c| matches!(c, SinkCall::Press(..)))
            .count();
        let releases = calls
            .iter()
            .filter(|c| matches!(c, SinkCall::Release(..)))
            .count();
        assert_eq!(presses, releases);
    }
}
