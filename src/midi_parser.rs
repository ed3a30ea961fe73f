use crate::model::song::{RawNote, Song, Track};
use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

const DEFAULT_MICROS_PER_QUARTER: u32 = 500_000;
const MICROSECONDS_PER_MINUTE: f64 = 60_000_000.0;

/// Note pairing uses a flat table keyed by `channel * 128 + pitch`; the
/// overflow side map only sees pathologically re-triggered notes.
const PAIRING_SLOTS: usize = 16 * 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("not a Standard MIDI File (missing MThd header)")]
    InvalidHeader,
    #[error("invalid MIDI header length {0}")]
    InvalidHeaderLength(u32),
    #[error("invalid track chunk header at offset {0}")]
    InvalidTrackHeader(usize),
    #[error("track chunk at offset {offset} with length {length} extends past end of file")]
    TruncatedChunk { offset: usize, length: u32 },
    #[error("variable-length quantity longer than four bytes")]
    VarlenTooLong,
    #[error("unexpected end of data")]
    Truncated,
}

/// Piecewise-linear tick -> seconds mapping built from the merged tempo
/// events of all tracks. Sequential conversions are O(1) amortized via a
/// cached segment index.
#[derive(Debug, Clone)]
pub struct TempoMap {
    division: u16,
    /// Non-zero selects SMPTE timing and the tempo arrays are unused.
    smpte_ticks_per_second: f64,
    ticks: Vec<i64>,
    micros_per_quarter: Vec<u32>,
    seconds: Vec<f64>,
    last_idx: usize,
}

impl TempoMap {
    pub fn new(division: u16, tempo_events: &[(i64, u32)]) -> Self {
        if division & 0x8000 != 0 {
            // SMPTE: the high byte is a negative two's-complement fps.
            let fps = -(((division >> 8) & 0xFF) as u8 as i8) as i32;
            let ticks_per_frame = (division & 0xFF) as i32;
            let fps_val = if fps == 29 { 29.97 } else { fps as f64 };
            debug!(
                "SMPTE division: {} fps x {} ticks/frame",
                fps_val, ticks_per_frame
            );
            return Self {
                division,
                smpte_ticks_per_second: fps_val * ticks_per_frame as f64,
                ticks: vec![0],
                micros_per_quarter: vec![DEFAULT_MICROS_PER_QUARTER],
                seconds: vec![0.0],
                last_idx: 0,
            };
        }

        let mut events = tempo_events.to_vec();
        events.sort_unstable();
        if events.first().map(|(t, _)| *t != 0).unwrap_or(true) {
            events.insert(0, (0, DEFAULT_MICROS_PER_QUARTER));
        }

        // Same-tick changes: last one wins.
        let mut ticks: Vec<i64> = Vec::with_capacity(events.len());
        let mut values: Vec<u32> = Vec::with_capacity(events.len());
        let mut seconds: Vec<f64> = Vec::with_capacity(events.len());
        for (tick, mpq) in events {
            if ticks.last() == Some(&tick) {
                *values.last_mut().unwrap() = mpq;
                continue;
            }
            let sec = match ticks.last() {
                Some(&prev_tick) => {
                    let prev_mpq = *values.last().unwrap() as f64;
                    let prev_sec = *seconds.last().unwrap();
                    prev_sec + (tick - prev_tick) as f64 * prev_mpq / division as f64 / 1e6
                }
                None => 0.0,
            };
            ticks.push(tick);
            values.push(mpq);
            seconds.push(sec);
        }

        Self {
            division,
            smpte_ticks_per_second: 0.0,
            ticks,
            micros_per_quarter: values,
            seconds,
            last_idx: 0,
        }
    }

    pub fn tick_to_seconds(&mut self, tick: i64) -> f64 {
        if self.smpte_ticks_per_second > 0.0 {
            return tick as f64 / self.smpte_ticks_per_second;
        }

        let mut idx = self.last_idx;
        if idx >= self.ticks.len() || self.ticks[idx] > tick {
            idx = 0;
        }
        while idx + 1 < self.ticks.len() && self.ticks[idx + 1] <= tick {
            idx += 1;
        }
        self.last_idx = idx;

        self.seconds[idx]
            + (tick - self.ticks[idx]) as f64 * self.micros_per_quarter[idx] as f64
                / self.division as f64
                / 1e6
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8, ParseError> {
        let b = *self.data.get(self.pos).ok_or(ParseError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_varlen(&mut self) -> Result<u32, ParseError> {
        let mut value: u32 = 0;
        for _ in 0..4 {
            let b = self.read_u8()?;
            value = (value << 7) | (b & 0x7F) as u32;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ParseError::VarlenTooLong)
    }

    fn skip(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }
}

fn read_u16_at(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(ParseError::Truncated)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32_at(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(ParseError::Truncated)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[derive(Default)]
struct TrackParse {
    track: Track,
    /// (start_tick, end_tick, pitch, channel 1..=16)
    notes: Vec<(i64, i64, i32, i32)>,
    tempo_events: Vec<(i64, u32)>,
    time_sig_events: Vec<(i64, (u8, u8))>,
    last_tick: i64,
}

fn parse_track(data: &[u8], track_index: usize) -> Result<TrackParse, ParseError> {
    let mut res = TrackParse::default();
    res.notes.reserve(data.len() / 4);

    let mut r = Reader::new(data);
    let mut abs_tick: i64 = 0;
    let mut running_status: Option<u8> = None;

    let mut start_tick = [0i64; PAIRING_SLOTS];
    let mut depth = [0u8; PAIRING_SLOTS];
    let mut overflow: HashMap<usize, Vec<i64>> = HashMap::new();

    let close_note = |slot: usize,
                          end_tick: i64,
                          start_tick: &mut [i64; PAIRING_SLOTS],
                          depth: &mut [u8; PAIRING_SLOTS],
                          overflow: &mut HashMap<usize, Vec<i64>>,
                          notes: &mut Vec<(i64, i64, i32, i32)>| {
        if depth[slot] == 0 {
            return;
        }
        let begin = start_tick[slot];
        depth[slot] -= 1;
        if depth[slot] > 0 {
            if let Some(stack) = overflow.get_mut(&slot) {
                if let Some(prev) = stack.pop() {
                    start_tick[slot] = prev;
                }
            }
        }
        let channel = (slot / 128) as i32 + 1;
        let pitch = (slot % 128) as i32;
        notes.push((begin, end_tick, pitch, channel));
    };

    while r.remaining() > 0 {
        let delta = r.read_varlen()?;
        abs_tick += delta as i64;

        if r.remaining() == 0 {
            break;
        }

        let mut status = r.data[r.pos];
        if status < 0x80 {
            match running_status {
                Some(s) => status = s,
                None => break,
            }
        } else {
            r.pos += 1;
            if status < 0xF0 {
                running_status = Some(status);
            }
        }

        if status == 0xFF {
            // Meta event.
            let meta_type = r.read_u8()?;
            let length = r.read_varlen()? as usize;
            let body_start = r.pos;
            if body_start + length > data.len() {
                break;
            }
            match meta_type {
                0x2F => break, // end of track
                0x03 => {
                    res.track.name =
                        String::from_utf8_lossy(&data[body_start..body_start + length]).into_owned();
                }
                0x51 if length == 3 => {
                    let mpq = (data[body_start] as u32) << 16
                        | (data[body_start + 1] as u32) << 8
                        | data[body_start + 2] as u32;
                    res.tempo_events.push((abs_tick, mpq));
                }
                0x58 if length >= 2 => {
                    let numerator = data[body_start];
                    let denominator = 1u8 << data[body_start + 1].min(7);
                    res.time_sig_events.push((abs_tick, (numerator, denominator)));
                }
                _ => {}
            }
            r.pos = body_start + length;
            continue;
        }

        if status == 0xF0 || status == 0xF7 {
            // SysEx consumes a varlen payload and cancels running status.
            let length = r.read_varlen()? as usize;
            r.skip(length);
            running_status = None;
            continue;
        }

        let event_type = status & 0xF0;
        let channel0 = (status & 0x0F) as usize;

        match event_type {
            0x90 => {
                if r.remaining() < 2 {
                    break;
                }
                let pitch = r.read_u8()? as usize & 0x7F;
                let velocity = r.read_u8()?;
                let slot = channel0 * 128 + pitch;
                if velocity == 0 {
                    close_note(
                        slot,
                        abs_tick,
                        &mut start_tick,
                        &mut depth,
                        &mut overflow,
                        &mut res.notes,
                    );
                } else {
                    if depth[slot] > 0 {
                        overflow.entry(slot).or_default().push(start_tick[slot]);
                    }
                    start_tick[slot] = abs_tick;
                    depth[slot] = depth[slot].saturating_add(1);
                    res.track.note_count += 1;
                }
            }
            0x80 => {
                if r.remaining() < 2 {
                    break;
                }
                let pitch = r.read_u8()? as usize & 0x7F;
                let _velocity = r.read_u8()?;
                let slot = channel0 * 128 + pitch;
                close_note(
                    slot,
                    abs_tick,
                    &mut start_tick,
                    &mut depth,
                    &mut overflow,
                    &mut res.notes,
                );
            }
            0xA0 | 0xB0 | 0xE0 => r.skip(2),
            0xC0 | 0xD0 => r.skip(1),
            _ => r.skip(1),
        }
    }

    if res.track.name.is_empty() {
        res.track.name = format!("Track {}", track_index);
    }

    // Close anything still sounding at the track's last tick.
    for slot in 0..PAIRING_SLOTS {
        while depth[slot] > 0 {
            close_note(
                slot,
                abs_tick,
                &mut start_tick,
                &mut depth,
                &mut overflow,
                &mut res.notes,
            );
        }
    }

    res.last_tick = abs_tick;
    Ok(res)
}

/// Parse an in-memory Standard MIDI File (format 0/1/2, metrical or SMPTE
/// division) into a [`Song`] with tempo-mapped wall-clock note times.
pub fn parse_midi(bytes: &[u8]) -> Result<Song, ParseError> {
    if bytes.len() < 14 || &bytes[0..4] != b"MThd" {
        return Err(ParseError::InvalidHeader);
    }
    let header_len = read_u32_at(bytes, 4)?;
    if header_len < 6 {
        return Err(ParseError::InvalidHeaderLength(header_len));
    }

    let format = read_u16_at(bytes, 8)?;
    let track_count = read_u16_at(bytes, 10)?;
    let division = read_u16_at(bytes, 12)?;
    if division == 0 {
        return Err(ParseError::InvalidHeader);
    }

    debug!(
        "SMF header: format={}, tracks={}, division={:#06x}",
        format, track_count, division
    );

    let mut pos = 8 + header_len as usize;
    let mut parses: Vec<TrackParse> = Vec::with_capacity(track_count as usize);
    let mut all_tempo: Vec<(i64, u32)> = Vec::new();
    let mut all_time_sig: Vec<(i64, (u8, u8))> = Vec::new();
    let mut last_tick_global: i64 = 0;

    for i in 0..track_count as usize {
        if pos + 8 > bytes.len() {
            warn!("file ends early: parsed {}/{} tracks", i, track_count);
            break;
        }
        if &bytes[pos..pos + 4] != b"MTrk" {
            return Err(ParseError::InvalidTrackHeader(pos));
        }
        let chunk_len = read_u32_at(bytes, pos + 4)?;
        let chunk_start = pos + 8;
        let chunk_end = chunk_start + chunk_len as usize;
        if chunk_end > bytes.len() {
            return Err(ParseError::TruncatedChunk {
                offset: pos,
                length: chunk_len,
            });
        }

        let parsed = parse_track(&bytes[chunk_start..chunk_end], i)?;
        debug!(
            "track {} ({:?}): {} notes, {} tempo events",
            i,
            parsed.track.name,
            parsed.notes.len(),
            parsed.tempo_events.len()
        );
        last_tick_global = last_tick_global.max(parsed.last_tick);
        all_tempo.extend_from_slice(&parsed.tempo_events);
        all_time_sig.extend_from_slice(&parsed.time_sig_events);
        parses.push(parsed);
        pos = chunk_end;
    }

    let mut tempo_map = TempoMap::new(division, &all_tempo);

    let mut song = Song::default();
    let mut max_end: f64 = 0.0;
    for parsed in &parses {
        let mut track_notes = Vec::with_capacity(parsed.notes.len());
        for &(start, end, pitch, channel) in &parsed.notes {
            let start_s = tempo_map.tick_to_seconds(start);
            let end_s = tempo_map.tick_to_seconds(end);
            let duration_s = (end_s - start_s).max(0.0);
            max_end = max_end.max(end_s);
            track_notes.push(RawNote {
                start_s: start_s as f32,
                duration_s: duration_s as f32,
                pitch,
                track_index: song.tracks.len() as i32,
                channel,
            });
        }
        song.tracks.push(parsed.track.clone());
        song.notes_by_track.push(track_notes);
    }

    song.length_s = if max_end <= 0.0 && last_tick_global > 0 {
        tempo_map.tick_to_seconds(last_tick_global) as f32
    } else {
        max_end as f32
    };

    all_tempo.sort_unstable();
    song.initial_bpm = match all_tempo.first() {
        Some(&(0, mpq)) if mpq > 0 => MICROSECONDS_PER_MINUTE / mpq as f64,
        _ => MICROSECONDS_PER_MINUTE / DEFAULT_MICROS_PER_QUARTER as f64,
    };

    all_time_sig.sort_unstable_by_key(|(tick, _)| *tick);
    song.initial_time_sig = match all_time_sig.first() {
        Some(&(0, sig)) => sig,
        _ => (4, 4),
    };

    debug!(
        "parsed MIDI: {} tracks, {} notes, {:.3}s, initial bpm {:.2}",
        song.tracks.len(),
        song.note_count(),
        song.length_s,
        song.initial_bpm
    );

    Ok(song)
}

/// Read and parse a MIDI file from disk.
pub fn import_midi_file<P: AsRef<Path>>(path: P) -> Result<Song> {
    let bytes = fs::read(path.as_ref())
        .with_context(|| format!("failed to read MIDI file {}", path.as_ref().display()))?;
    let song = parse_midi(&bytes)
        .with_context(|| format!("failed to parse MIDI file {}", path.as_ref().display()))?;
    Ok(song)
}

#[cfg(test)]
mod test {
    use super::*;

    fn varlen(mut value: u32) -> Vec<u8> {
        let mut out = vec![(value & 0x7F) as u8];
        value >>= 7;
        while value > 0 {
            out.insert(0, 0x80 | (value & 0x7F) as u8);
            value >>= 7;
        }
        out
    }

    fn header(format: u16, tracks: u16, division: u16) -> Vec<u8> {
        let mut out = b"MThd".to_vec();
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&format.to_be_bytes());
        out.extend_from_slice(&tracks.to_be_bytes());
        out.extend_from_slice(&division.to_be_bytes());
        out
    }

    fn track_chunk(body: &[u8]) -> Vec<u8> {
        let mut out = b"MTrk".to_vec();
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn tempo_event(delta: u32, micros: u32) -> Vec<u8> {
        let mut out = varlen(delta);
        out.extend_from_slice(&[0xFF, 0x51, 0x03]);
        out.extend_from_slice(&micros.to_be_bytes()[1..]);
        out
    }

    fn note_on(delta: u32, channel0: u8, pitch: u8, velocity: u8) -> Vec<u8> {
        let mut out = varlen(delta);
        out.extend_from_slice(&[0x90 | channel0, pitch, velocity]);
        out
    }

    fn note_off(delta: u32, channel0: u8, pitch: u8) -> Vec<u8> {
        let mut out = varlen(delta);
        out.extend_from_slice(&[0x80 | channel0, pitch, 0x40]);
        out
    }

    fn end_of_track(delta: u32) -> Vec<u8> {
        let mut out = varlen(delta);
        out.extend_from_slice(&[0xFF, 0x2F, 0x00]);
        out
    }

    #[test]
    fn minimal_single_note_file() {
        let mut body = tempo_event(0, 500_000);
        body.extend(note_on(0, 0, 60, 100));
        body.extend(note_off(480, 0, 60));
        body.extend(end_of_track(0));

        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        assert_eq!(song.tracks.len(), 1);
        assert!((song.length_s - 0.5).abs() < 1e-6);
        assert_eq!(song.notes_by_track[0].len(), 1);

        let note = song.notes_by_track[0][0];
        assert!((note.start_s - 0.0).abs() < 1e-6);
        assert!((note.duration_s - 0.5).abs() < 1e-6);
        assert_eq!(note.pitch, 60);
        assert_eq!(note.track_index, 0);
        assert_eq!(note.channel, 1);
        assert!((song.initial_bpm - 120.0).abs() < 1e-9);
    }

    #[test]
    fn running_status_carries_between_notes() {
        let mut body = Vec::new();
        body.extend(note_on(0, 0, 60, 100));
        // Same status omitted: note-on pitch 64, then two vel-0 closes.
        body.extend(varlen(0));
        body.extend_from_slice(&[64, 100]);
        body.extend(varlen(480));
        body.extend_from_slice(&[60, 0]);
        body.extend(varlen(0));
        body.extend_from_slice(&[64, 0]);
        body.extend(end_of_track(0));

        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        let notes = &song.notes_by_track[0];
        assert_eq!(notes.len(), 2);
        assert_eq!(notes.iter().filter(|n| n.pitch == 60).count(), 1);
        assert_eq!(notes.iter().filter(|n| n.pitch == 64).count(), 1);
        for n in notes {
            assert!((n.duration_s - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn unclosed_note_is_closed_at_track_end() {
        let mut body = note_on(0, 0, 72, 90);
        body.extend(end_of_track(960));

        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        let note = song.notes_by_track[0][0];
        assert!((note.duration_s - 1.0).abs() < 1e-6);
    }

    #[test]
    fn retriggered_note_pairs_lifo() {
        let mut body = note_on(0, 0, 60, 100);
        body.extend(note_on(240, 0, 60, 100));
        body.extend(note_off(240, 0, 60));
        body.extend(note_off(240, 0, 60));
        body.extend(end_of_track(0));

        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        let notes = &song.notes_by_track[0];
        assert_eq!(notes.len(), 2);
        // Inner note (tick 240..480) closes first, then the outer 0..720.
        assert!((notes[0].start_s - 0.25).abs() < 1e-6);
        assert!((notes[0].duration_s - 0.25).abs() < 1e-6);
        assert!((notes[1].start_s - 0.0).abs() < 1e-6);
        assert!((notes[1].duration_s - 0.75).abs() < 1e-6);
    }

    #[test]
    fn tempo_change_mid_file() {
        let mut body = tempo_event(0, 500_000);
        body.extend(note_on(0, 0, 60, 100));
        body.extend(tempo_event(480, 250_000));
        body.extend(note_off(480, 0, 60));
        body.extend(end_of_track(0));

        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        let note = song.notes_by_track[0][0];
        // 480 ticks at 120bpm then 480 ticks at 240bpm.
        assert!((note.duration_s - 0.75).abs() < 1e-6);
        assert!((song.length_s - 0.75).abs() < 1e-6);
    }

    #[test]
    fn tempo_map_is_monotonic() {
        let events = vec![(0i64, 500_000u32), (480, 250_000), (960, 1_000_000)];
        let mut map = TempoMap::new(480, &events);
        let mut prev = f64::MIN;
        for tick in (0..2000).step_by(7) {
            let s = map.tick_to_seconds(tick);
            assert!(s >= prev);
            prev = s;
        }
        // Backward conversion resets the cached index and still agrees.
        let early = map.tick_to_seconds(10);
        assert!((early - 10.0 * 500_000.0 / 480.0 / 1e6).abs() < 1e-9);
    }

    #[test]
    fn smpte_division() {
        // 25 fps x 40 ticks/frame = 1000 ticks per second.
        let division = ((-25i8 as u8 as u16) << 8) | 40;
        let mut body = note_on(0, 0, 60, 100);
        body.extend(note_off(500, 0, 60));
        body.extend(end_of_track(0));

        let mut bytes = header(0, 1, division);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        assert!((song.notes_by_track[0][0].duration_s - 0.5).abs() < 1e-6);
    }

    #[test]
    fn smpte_29_means_drop_frame() {
        let division = ((-29i8 as u8 as u16) << 8) | 100;
        let mut map = TempoMap::new(division, &[]);
        let s = map.tick_to_seconds(2997);
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn percussion_channel_is_preserved() {
        let mut body = note_on(0, 9, 40, 100);
        body.extend(note_off(480, 9, 40));
        body.extend(end_of_track(0));

        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        assert_eq!(song.notes_by_track[0][0].channel, 10);
    }

    #[test]
    fn track_name_and_default_name() {
        let mut body = varlen(0);
        body.extend_from_slice(&[0xFF, 0x03, 4]);
        body.extend_from_slice(b"Lead");
        body.extend(end_of_track(0));

        let mut bytes = header(1, 2, 480);
        bytes.extend(track_chunk(&body));
        bytes.extend(track_chunk(&end_of_track(0)));

        let song = parse_midi(&bytes).unwrap();
        assert_eq!(song.tracks[0].name, "Lead");
        assert_eq!(song.tracks[1].name, "Track 1");
    }

    #[test]
    fn initial_time_signature() {
        let mut body = varlen(0);
        body.extend_from_slice(&[0xFF, 0x58, 4, 3, 3, 24, 8]); // 3/8
        body.extend(end_of_track(0));

        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        assert_eq!(song.initial_time_sig, (3, 8));
    }

    #[test]
    fn sysex_is_skipped_and_resets_running_status() {
        let mut body = note_on(0, 0, 60, 100);
        // SysEx with 3 payload bytes.
        body.extend(varlen(0));
        body.push(0xF0);
        body.extend(varlen(3));
        body.extend_from_slice(&[0x01, 0x02, 0xF7]);
        body.extend(note_off(480, 0, 60));
        body.extend(end_of_track(0));

        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        assert_eq!(song.notes_by_track[0].len(), 1);
        assert!((song.notes_by_track[0][0].duration_s - 0.5).abs() < 1e-6);
    }

    #[test]
    fn rejects_bad_header() {
        assert_eq!(parse_midi(b"RIFF").unwrap_err(), ParseError::InvalidHeader);
        assert_eq!(
            parse_midi(b"XXXX\x00\x00\x00\x06\x00\x00\x00\x01\x01\xe0").unwrap_err(),
            ParseError::InvalidHeader
        );
    }

    #[test]
    fn rejects_short_header_length() {
        let mut bytes = b"MThd".to_vec();
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 1, 1, 0xE0]);
        assert_eq!(
            parse_midi(&bytes).unwrap_err(),
            ParseError::InvalidHeaderLength(5)
        );
    }

    #[test]
    fn rejects_bad_track_magic() {
        let mut bytes = header(0, 1, 480);
        bytes.extend_from_slice(b"Mtrk\x00\x00\x00\x00");
        assert!(matches!(
            parse_midi(&bytes).unwrap_err(),
            ParseError::InvalidTrackHeader(_)
        ));
    }

    #[test]
    fn rejects_truncated_chunk() {
        let mut bytes = header(0, 1, 480);
        let mut chunk = b"MTrk".to_vec();
        chunk.extend_from_slice(&100u32.to_be_bytes());
        chunk.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
        bytes.extend(chunk);
        assert!(matches!(
            parse_midi(&bytes).unwrap_err(),
            ParseError::TruncatedChunk { .. }
        ));
    }

    #[test]
    fn rejects_overlong_varlen() {
        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]));
        assert_eq!(parse_midi(&bytes).unwrap_err(), ParseError::VarlenTooLong);
    }

    #[test]
    fn length_falls_back_to_last_tick_without_notes() {
        let mut body = tempo_event(0, 500_000);
        body.extend(end_of_track(960));

        let mut bytes = header(0, 1, 480);
        bytes.extend(track_chunk(&body));

        let song = parse_midi(&bytes).unwrap();
        assert!(song.is_empty());
        assert!((song.length_s - 1.0).abs() < 1e-6);
    }
}
