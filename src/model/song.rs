use serde::{Deserialize, Serialize};

/// A single note as read from the file, in absolute wall-clock seconds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RawNote {
    /// Absolute start time from the beginning of the file, seconds.
    pub start_s: f32,
    /// Sounding length, seconds. Never negative.
    pub duration_s: f32,
    /// MIDI pitch, 0..=127.
    pub pitch: i32,
    /// Index into `Song::tracks`.
    pub track_index: i32,
    /// MIDI channel, 1..=16. Channel 10 is percussion.
    pub channel: i32,
}

impl RawNote {
    pub fn end_s(&self) -> f32 {
        self.start_s + self.duration_s
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Track {
    pub name: String,
    pub note_count: usize,
}

/// A fully parsed MIDI file: per-track note lists with the tempo map
/// already baked into wall-clock times.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Song {
    pub tracks: Vec<Track>,
    pub notes_by_track: Vec<Vec<RawNote>>,
    /// Max note end time across all tracks, seconds.
    pub length_s: f32,
    pub initial_bpm: f64,
    pub initial_time_sig: (u8, u8),
}

impl Default for Song {
    fn default() -> Self {
        Self {
            tracks: Vec::new(),
            notes_by_track: Vec::new(),
            length_s: 0.0,
            initial_bpm: 120.0,
            initial_time_sig: (4, 4),
        }
    }
}

impl Song {
    pub fn note_count(&self) -> usize {
        self.notes_by_track.iter().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.notes_by_track.iter().all(|t| t.is_empty())
    }
}
