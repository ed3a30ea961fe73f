use crate::model::config::{ChannelConfig, GlobalConfig, Modifier, WindowId, CHANNEL_COUNT};
use crate::model::keymap::KeyMap;
use crate::model::song::RawNote;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};

/// Two starts closer than this belong to the same chord.
const CHORD_THRESHOLD_S: f64 = 0.030;
/// Per-note stagger applied inside a decomposed chord.
const CHORD_STAGGER_S: f64 = 0.015;
/// Starts/durations closer than this count as the same note instance.
const DUP_EPSILON_S: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    /// Sorts before `Down` so equal-time transitions release first.
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedEvent {
    pub time_s: f64,
    pub kind: EventKind,
    pub key_code: u32,
    pub modifier: Modifier,
    pub window: Option<WindowId>,
}

/// Everything one rebuild needs to read. `notes` must be sorted by
/// `start_s`; `histograms` holds per-track pitch counts.
pub struct BuildInput<'a> {
    pub notes: &'a [RawNote],
    pub histograms: &'a [[u32; 128]],
    pub global: &'a GlobalConfig,
    pub channels: &'a [ChannelConfig; CHANNEL_COUNT],
    pub keymap: &'a KeyMap,
    /// Live playback with several active channels skips channels that have
    /// neither a window nor a track filter; at rest every channel routes.
    pub live_playing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub input_notes: usize,
    pub emitted_notes: usize,
    pub dropped_unmapped: usize,
    pub events: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingNote {
    start: f64,
    end: f64,
    pitch: i32,
    window: Option<WindowId>,
    key_code: u32,
    modifier: Modifier,
}

impl PendingNote {
    fn is_valid(&self) -> bool {
        self.end > self.start
    }
}

#[derive(Debug, Clone, Copy)]
struct RoutedConfig {
    transpose: i32,
    smart: bool,
    target_track: i32,
    window: Option<WindowId>,
}

/// Turns the parsed note list plus the live configuration into the sorted
/// press/release stream. Owns its scratch buffers so repeated rebuilds do
/// not churn the heap.
#[derive(Debug, Default)]
pub struct EventBuilder {
    scratch: Vec<PendingNote>,
    decomposed: Vec<PendingNote>,
    events: Vec<TimedEvent>,
    track_shifts: Vec<i32>,
    configs: Vec<RoutedConfig>,
    last_active: HashMap<(Option<WindowId>, i32), usize>,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    pub fn rebuild(&mut self, input: &BuildInput<'_>) -> BuildStats {
        let mut stats = BuildStats {
            input_notes: input.notes.len(),
            ..Default::default()
        };

        self.events.clear();
        self.scratch.clear();
        if input.notes.is_empty() {
            return stats;
        }

        self.select_configs(input);
        self.compute_track_shifts(input);
        self.fan_out(input);
        self.resolve_overlaps();
        if input.global.decompose {
            self.decompose();
        }
        stats.dropped_unmapped = self.map_keys(input.keymap);
        stats.emitted_notes = self.expand_events();
        stats.events = self.events.len();

        debug!(
            "event rebuild: {} raw notes -> {} notes, {} events, {} unmapped",
            stats.input_notes, stats.emitted_notes, stats.events, stats.dropped_unmapped
        );
        stats
    }

    /// Stage 1: pick the channel configs that route notes this build.
    fn select_configs(&mut self, input: &BuildInput<'_>) {
        self.configs.clear();
        let enabled: Vec<&ChannelConfig> =
            input.channels.iter().filter(|c| c.enabled).collect();

        if enabled.is_empty() {
            // Startup grace: nothing configured yet plays everything to the
            // focused window, untransposed.
            self.configs.push(RoutedConfig {
                transpose: 0,
                smart: true,
                target_track: -1,
                window: None,
            });
            return;
        }

        for ch in &enabled {
            // A channel with neither a window nor a track filter would
            // duplicate every routed note during live multi-channel play.
            if input.live_playing
                && enabled.len() > 1
                && ch.window.is_none()
                && !ch.has_specific_track()
            {
                continue;
            }
            self.configs.push(RoutedConfig {
                transpose: ch.transpose_semitones,
                smart: ch.is_smart_transpose(),
                target_track: ch.track_filter,
                window: ch.window,
            });
        }
    }

    /// Stage 2: per-track octave shift that lands the most notes inside the
    /// playable range, used by smart-transpose channels.
    fn compute_track_shifts(&mut self, input: &BuildInput<'_>) {
        self.track_shifts.clear();
        self.track_shifts
            .extend(input.histograms.iter().map(|hist| {
                best_octave_shift(hist, input.global.min_pitch, input.global.max_pitch)
            }));
    }

    /// Stage 3: fan every raw note out through every routed config.
    fn fan_out(&mut self, input: &BuildInput<'_>) {
        let min = input.global.min_pitch;
        let max = input.global.max_pitch;

        for raw in input.notes {
            for cfg in &self.configs {
                if cfg.target_track >= 0 {
                    if raw.track_index != cfg.target_track {
                        continue;
                    }
                } else if raw.channel == 10 {
                    // All-tracks routing skips percussion.
                    continue;
                }

                let mut transpose = cfg.transpose;
                if cfg.smart {
                    if let Some(shift) =
                        self.track_shifts.get(raw.track_index.max(0) as usize)
                    {
                        transpose += shift;
                    }
                }

                let mut pitch = raw.pitch + transpose;
                if cfg.smart {
                    while pitch < min {
                        pitch += 12;
                    }
                    while pitch > max {
                        pitch -= 12;
                    }
                    pitch = pitch.clamp(min, max);
                }
                // Manual transpose is not clamped: out-of-range pitches fall
                // out at the key-mapping stage.

                self.scratch.push(PendingNote {
                    start: raw.start_s as f64,
                    end: raw.end_s() as f64,
                    pitch,
                    window: cfg.window,
                    key_code: 0,
                    modifier: Modifier::None,
                });
            }
        }
    }

    /// Stage 4: same-(window, pitch) conflict resolution in arrival order.
    fn resolve_overlaps(&mut self) {
        self.last_active.clear();
        for i in 0..self.scratch.len() {
            let key = (self.scratch[i].window, self.scratch[i].pitch);
            if let Some(&prev_idx) = self.last_active.get(&key) {
                let (before, after) = self.scratch.split_at_mut(i);
                resolve_pair(&mut before[prev_idx], &mut after[0]);
            }
            if self.scratch[i].is_valid() {
                self.last_active.insert(key, i);
            }
        }
    }

    /// Stage 5: chord decomposition, monophonic per window.
    fn decompose(&mut self) {
        let mut grouped: BTreeMap<Option<WindowId>, Vec<PendingNote>> = BTreeMap::new();
        for note in self.scratch.iter().filter(|n| n.is_valid()) {
            grouped.entry(note.window).or_default().push(*note);
        }

        self.decomposed.clear();
        for (_, mut group) in grouped {
            group.sort_by(|a, b| a.start.total_cmp(&b.start));

            let mut i = 0;
            while i < group.len() {
                let chord_start = group[i].start;
                let mut j = i + 1;
                while j < group.len() && group[j].start - chord_start < CHORD_THRESHOLD_S {
                    j += 1;
                }
                if j - i > 1 {
                    group[i..j].sort_by(|a, b| {
                        a.pitch.cmp(&b.pitch).then(a.start.total_cmp(&b.start))
                    });
                    for (k, note) in group[i..j].iter_mut().enumerate() {
                        note.start = chord_start + k as f64 * CHORD_STAGGER_S;
                    }
                }
                i = j;
            }

            group.sort_by(|a, b| a.start.total_cmp(&b.start));
            for k in 0..group.len().saturating_sub(1) {
                let next_start = group[k + 1].start;
                if group[k].end > next_start {
                    group[k].end = next_start;
                }
            }

            self.decomposed
                .extend(group.iter().filter(|n| n.is_valid()));
        }

        std::mem::swap(&mut self.scratch, &mut self.decomposed);
    }

    /// Stage 6: attach key bindings, dropping unmapped pitches.
    fn map_keys(&mut self, keymap: &KeyMap) -> usize {
        let mut dropped = 0;
        for note in self.scratch.iter_mut().filter(|n| n.is_valid()) {
            match keymap.get(note.pitch) {
                Some(binding) => {
                    note.key_code = binding.key_code;
                    note.modifier = binding.modifier;
                }
                None => {
                    dropped += 1;
                    note.end = note.start;
                }
            }
        }
        if dropped > 0 {
            warn!("{} notes dropped: no key mapping", dropped);
        }
        dropped
    }

    /// Stage 7: expand to Down/Up pairs and sort.
    fn expand_events(&mut self) -> usize {
        let mut emitted = 0;
        self.events.reserve(self.scratch.len() * 2);
        for note in self.scratch.iter().filter(|n| n.is_valid()) {
            emitted += 1;
            self.events.push(TimedEvent {
                time_s: note.start,
                kind: EventKind::Down,
                key_code: note.key_code,
                modifier: note.modifier,
                window: note.window,
            });
            self.events.push(TimedEvent {
                time_s: note.end,
                kind: EventKind::Up,
                key_code: note.key_code,
                modifier: note.modifier,
                window: note.window,
            });
        }

        // Quantizing to microseconds keeps the comparator total while giving
        // equal-time ties (within 1 us) a deterministic Up-before-Down order.
        self.events
            .sort_by_key(|e| ((e.time_s * 1e6).round() as i64, e.kind));
        emitted
    }
}

/// Octave shift in {-48..=48} that maximizes the histogram mass landing in
/// `[min_pitch, max_pitch]`; ties go to the smallest absolute shift.
fn best_octave_shift(hist: &[u32; 128], min_pitch: i32, max_pitch: i32) -> i32 {
    let mut prefix = [0u32; 129];
    for p in 0..128 {
        prefix[p + 1] = prefix[p] + hist[p];
    }

    let mut best_score = -1i64;
    let mut best_oct = 0i32;
    for oct in -4..=4i32 {
        let shift = oct * 12;
        let low = (min_pitch - shift).clamp(0, 127);
        let high = (max_pitch - shift).clamp(0, 127);
        let score = if low <= high {
            (prefix[high as usize + 1] - prefix[low as usize]) as i64
        } else {
            0
        };
        if score > best_score || (score == best_score && oct.abs() < best_oct.abs()) {
            best_score = score;
            best_oct = oct;
        }
    }
    best_oct * 12
}

fn resolve_pair(prev: &mut PendingNote, curr: &mut PendingNote) {
    let prev_dur = prev.end - prev.start;
    let curr_dur = curr.end - curr.start;

    // Exact duplicate from multi-config fan-out: keep the first.
    if (prev.start - curr.start).abs() < DUP_EPSILON_S
        && (prev_dur - curr_dur).abs() < DUP_EPSILON_S
    {
        curr.end = curr.start - 1.0;
        return;
    }

    // Arrival order is start order; guard against float noise.
    if curr.start < prev.start {
        curr.start = prev.start;
    }

    // Same-start containment: the longer note wins the shared extent.
    if (prev.start - curr.start).abs() < DUP_EPSILON_S && prev.end > curr.end {
        curr.end = prev.end;
    }

    // Truncate the earlier note at the later one's start. No gap: legato.
    if prev.end > curr.start {
        prev.end = curr.start;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const WIN: WindowId = WindowId(0x1234);

    fn raw(start: f32, duration: f32, pitch: i32, track: i32, channel: i32) -> RawNote {
        RawNote {
            start_s: start,
            duration_s: duration,
            pitch,
            track_index: track,
            channel,
        }
    }

    fn histograms(notes: &[RawNote], tracks: usize) -> Vec<[u32; 128]> {
        let mut hists = vec![[0u32; 128]; tracks];
        for n in notes {
            if (0..128).contains(&n.pitch) && (n.track_index as usize) < tracks {
                hists[n.track_index as usize][n.pitch as usize] += 1;
            }
        }
        hists
    }

    fn channels_with(configs: &[(usize, ChannelConfig)]) -> [ChannelConfig; CHANNEL_COUNT] {
        let mut channels = [ChannelConfig::default(); CHANNEL_COUNT];
        for (idx, cfg) in configs {
            channels[*idx] = *cfg;
        }
        channels
    }

    fn build(
        notes: &[RawNote],
        channels: [ChannelConfig; CHANNEL_COUNT],
        global: GlobalConfig,
        keymap: &KeyMap,
        live_playing: bool,
    ) -> (Vec<TimedEvent>, BuildStats) {
        let mut sorted = notes.to_vec();
        sorted.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));
        let hists = histograms(&sorted, 8);
        let mut builder = EventBuilder::new();
        let stats = builder.rebuild(&BuildInput {
            notes: &sorted,
            histograms: &hists,
            global: &global,
            channels: &channels,
            keymap,
            live_playing,
        });
        (builder.events().to_vec(), stats)
    }

    /// Pairing invariant: per (key, window), strictly alternating
    /// Down/Up starting with Down and ending balanced.
    fn assert_paired(events: &[TimedEvent]) {
        let mut open: HashMap<(u32, Option<WindowId>), usize> = HashMap::new();
        let mut last_time = f64::MIN;
        for e in events {
            assert!(e.time_s >= last_time - 1e-9, "events out of order");
            last_time = last_time.max(e.time_s);
            let slot = open.entry((e.key_code, e.window)).or_insert(0);
            match e.kind {
                EventKind::Down => *slot += 1,
                EventKind::Up => {
                    assert!(*slot > 0, "Up without a matching Down");
                    *slot -= 1;
                }
            }
        }
        assert!(open.values().all(|&n| n == 0), "unbalanced Down/Up");
    }

    fn enabled_channel(window: Option<WindowId>) -> ChannelConfig {
        ChannelConfig {
            enabled: true,
            transpose_semitones: 0,
            window,
            track_filter: -1,
        }
    }

    #[test]
    fn identity_build() {
        let notes = [raw(0.0, 0.5, 60, 0, 1)];
        let channels = channels_with(&[(0, enabled_channel(Some(WIN)))]);
        let (events, stats) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );

        assert_eq!(stats.emitted_notes, 1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Down);
        assert_eq!(events[0].key_code, 'Q' as u32);
        assert_eq!(events[0].modifier, Modifier::None);
        assert_eq!(events[0].window, Some(WIN));
        assert!((events[0].time_s - 0.0).abs() < 1e-9);
        assert_eq!(events[1].kind, EventKind::Up);
        assert!((events[1].time_s - 0.5).abs() < 1e-9);
    }

    #[test]
    fn smart_transpose_lifts_low_notes_into_range() {
        let notes = [raw(0.0, 0.5, 36, 0, 1)];
        let channels = channels_with(&[(0, enabled_channel(Some(WIN)))]);
        let (events, stats) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );

        // 36 is an octave below range 48..=84: best shift is +12, and 48 is
        // mapped in the default map, so the pair is emitted.
        assert_eq!(stats.dropped_unmapped, 0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key_code, 'I' as u32);
    }

    #[test]
    fn smart_transpose_prefers_smallest_shift_on_tie() {
        let hist = {
            let mut h = [0u32; 128];
            h[36] = 1;
            h
        };
        assert_eq!(best_octave_shift(&hist, 48, 84), 12);

        let centered = {
            let mut h = [0u32; 128];
            h[60] = 3;
            h
        };
        assert_eq!(best_octave_shift(&centered, 48, 84), 0);
    }

    #[test]
    fn manual_transpose_is_not_clamped() {
        let notes = [raw(0.0, 0.5, 30, 0, 1)];
        let mut channel = enabled_channel(Some(WIN));
        channel.transpose_semitones = 2; // manual: 30 -> 32, unmapped
        let channels = channels_with(&[(0, channel)]);
        let (events, stats) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );

        assert_eq!(stats.dropped_unmapped, 1);
        assert!(events.is_empty());
    }

    #[test]
    fn no_enabled_channels_falls_back_to_all_tracks() {
        let notes = [raw(0.0, 0.5, 60, 0, 1)];
        let channels = [ChannelConfig::default(); CHANNEL_COUNT];
        let (events, _) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].window, None);
    }

    #[test]
    fn percussion_skipped_by_all_tracks_config() {
        let notes = [raw(0.0, 0.5, 60, 0, 10), raw(0.0, 0.5, 60, 0, 1)];
        let channels = channels_with(&[(0, enabled_channel(Some(WIN)))]);
        let (events, _) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );

        // The channel-10 note is skipped; only one pair remains.
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn track_filtered_channel_keeps_percussion() {
        let notes = [raw(0.0, 0.5, 60, 0, 10)];
        let mut channel = enabled_channel(Some(WIN));
        channel.track_filter = 0;
        let channels = channels_with(&[(0, channel)]);
        let (events, _) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn unrouted_channel_skipped_during_live_multi_channel_play() {
        let notes = [raw(0.0, 0.5, 60, 0, 1)];
        let routed = ChannelConfig {
            enabled: true,
            transpose_semitones: 0,
            window: Some(WIN),
            track_filter: -1,
        };
        let unrouted = ChannelConfig {
            enabled: true,
            transpose_semitones: 0,
            window: None,
            track_filter: -1,
        };
        let channels = channels_with(&[(0, routed), (1, unrouted)]);

        let (live_events, _) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            true,
        );
        assert_eq!(live_events.len(), 2);
        assert!(live_events.iter().all(|e| e.window == Some(WIN)));

        // At rest the unrouted channel still routes (preview behavior).
        let (idle_events, _) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );
        assert_eq!(idle_events.len(), 4);
    }

    #[test]
    fn same_pitch_overlap_truncates_previous() {
        let notes = [raw(0.0, 1.0, 60, 0, 1), raw(0.5, 0.3, 60, 0, 1)];
        let channels = channels_with(&[(0, enabled_channel(Some(WIN)))]);
        let (events, _) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );

        assert_eq!(events.len(), 4);
        let times: Vec<(f64, EventKind)> = events.iter().map(|e| (e.time_s, e.kind)).collect();
        assert!((times[0].0 - 0.0).abs() < 1e-9 && times[0].1 == EventKind::Down);
        assert!((times[1].0 - 0.5).abs() < 1e-9 && times[1].1 == EventKind::Up);
        assert!((times[2].0 - 0.5).abs() < 1e-9 && times[2].1 == EventKind::Down);
        assert!((times[3].0 - 0.8).abs() < 1e-9 && times[3].1 == EventKind::Up);
        assert_paired(&events);
    }

    #[test]
    fn exact_duplicate_from_fan_out_is_dropped() {
        let notes = [raw(0.0, 0.5, 60, 0, 1)];
        let channels = channels_with(&[
            (0, enabled_channel(Some(WIN))),
            (1, enabled_channel(Some(WIN))),
        ]);
        let (events, _) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn same_start_containment_keeps_longer_extent() {
        let notes = [raw(0.0, 1.0, 60, 0, 1), raw(0.0, 0.4, 60, 0, 1)];
        let channels = channels_with(&[(0, enabled_channel(Some(WIN)))]);
        let (events, _) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );

        // The pair merges into one note spanning the full second.
        assert_eq!(events.len(), 2);
        assert!((events[1].time_s - 1.0).abs() < 1e-9);
        assert_paired(&events);
    }

    #[test]
    fn chord_decomposition_staggers_and_truncates() {
        let notes = [
            raw(0.00, 0.50, 60, 0, 1),
            raw(0.01, 0.49, 64, 0, 1),
            raw(0.02, 0.48, 67, 0, 1),
        ];
        let channels = channels_with(&[(0, enabled_channel(Some(WIN)))]);
        let global = GlobalConfig {
            decompose: true,
            ..GlobalConfig::default()
        };
        let (events, stats) = build(&notes, channels, global, &KeyMap::default(), false);

        assert_eq!(stats.emitted_notes, 3);
        assert_eq!(events.len(), 6);

        let downs: Vec<&TimedEvent> =
            events.iter().filter(|e| e.kind == EventKind::Down).collect();
        let ups: Vec<&TimedEvent> =
            events.iter().filter(|e| e.kind == EventKind::Up).collect();

        assert!((downs[0].time_s - 0.000).abs() < 1e-9);
        assert!((downs[1].time_s - 0.015).abs() < 1e-9);
        assert!((downs[2].time_s - 0.030).abs() < 1e-9);

        // Each staggered note ends where the next begins; the last keeps
        // its own end.
        assert!((ups[0].time_s - 0.015).abs() < 1e-9);
        assert!((ups[1].time_s - 0.030).abs() < 1e-9);
        assert!((ups[2].time_s - 0.50).abs() < 1e-9);
        assert_paired(&events);
    }

    #[test]
    fn decompose_groups_per_window() {
        let win_b = WindowId(0x9999);
        let mut ch_b = enabled_channel(Some(win_b));
        ch_b.track_filter = 0;
        let channels = channels_with(&[(0, enabled_channel(Some(WIN))), (1, ch_b)]);
        let notes = [raw(0.0, 0.5, 60, 0, 1), raw(0.005, 0.5, 64, 0, 1)];
        let global = GlobalConfig {
            decompose: true,
            ..GlobalConfig::default()
        };
        let (events, _) = build(&notes, channels, global, &KeyMap::default(), false);

        // Both windows get their own staggered copy of the chord.
        for win in [Some(WIN), Some(win_b)] {
            let downs: Vec<&TimedEvent> = events
                .iter()
                .filter(|e| e.kind == EventKind::Down && e.window == win)
                .collect();
            assert_eq!(downs.len(), 2);
            assert!((downs[1].time_s - downs[0].time_s - CHORD_STAGGER_S).abs() < 1e-9);
        }
        assert_paired(&events);
    }

    #[test]
    fn up_sorts_before_down_at_equal_time() {
        let notes = [raw(0.0, 0.5, 60, 0, 1), raw(0.5, 0.5, 62, 0, 1)];
        let channels = channels_with(&[(0, enabled_channel(Some(WIN)))]);
        let (events, _) = build(
            &notes,
            channels,
            GlobalConfig::default(),
            &KeyMap::default(),
            false,
        );

        assert_eq!(events.len(), 4);
        assert_eq!(events[1].kind, EventKind::Up);
        assert_eq!(events[2].kind, EventKind::Down);
        assert!((events[1].time_s - events[2].time_s).abs() < 1e-9);
    }

    #[test]
    fn rebuild_is_deterministic() {
        let notes = [
            raw(0.00, 0.50, 60, 0, 1),
            raw(0.01, 0.30, 64, 0, 1),
            raw(0.02, 0.40, 67, 0, 1),
            raw(0.60, 0.20, 36, 0, 1),
            raw(0.70, 0.20, 99, 0, 1),
        ];
        let channels = channels_with(&[
            (0, enabled_channel(Some(WIN))),
            (3, enabled_channel(Some(WindowId(7)))),
        ]);
        let global = GlobalConfig {
            decompose: true,
            ..GlobalConfig::default()
        };

        let (first, _) = build(&notes, channels, global, &KeyMap::default(), false);
        let (second, _) = build(&notes, channels, global, &KeyMap::default(), false);
        assert_eq!(first, second);
        assert_paired(&first);
    }
}
