use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CHANNEL_COUNT: usize = 16;

pub const MIN_TRANSPOSE: i32 = -24;
pub const MAX_TRANSPOSE: i32 = 24;

/// Opaque handle of a target window. On Windows this wraps an `HWND`.
/// `None` in the places that take `Option<WindowId>` means "whatever window
/// currently has focus".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(pub isize);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modifier {
    #[default]
    None,
    Shift,
    Ctrl,
}

/// One entry of the note map: the key to press and the modifier wrapped
/// around it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBinding {
    pub key_code: u32,
    pub modifier: Modifier,
}

/// Routing and transpose settings for one of the sixteen logical channels.
///
/// `transpose_semitones == 0` selects smart transpose: the event builder
/// picks a per-track octave shift that maximizes in-range coverage. Any
/// non-zero value is manual and is applied without clamping.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub transpose_semitones: i32,
    pub window: Option<WindowId>,
    /// -1 routes every track through this channel; any other value selects
    /// a single source track by index.
    pub track_filter: i32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            transpose_semitones: 0,
            window: None,
            track_filter: -1,
        }
    }
}

impl ChannelConfig {
    pub fn is_smart_transpose(&self) -> bool {
        self.transpose_semitones == 0
    }

    pub fn has_specific_track(&self) -> bool {
        self.track_filter != -1
    }
}

/// Settings shared by all channels.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GlobalConfig {
    pub min_pitch: i32,
    pub max_pitch: i32,
    pub speed: f64,
    pub decompose: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            min_pitch: 48,
            max_pitch: 84,
            speed: 1.0,
            decompose: false,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ConfigError {
    #[error("invalid pitch range {min}..={max} (need 0 <= min <= max <= 127)")]
    BadPitchRange { min: i32, max: i32 },
    #[error("playback speed must be finite and positive, got {0}")]
    BadSpeed(f64),
    #[error("channel index {0} out of range (0..16)")]
    BadChannel(usize),
}

pub fn validate_pitch_range(min: i32, max: i32) -> Result<(), ConfigError> {
    if min < 0 || max > 127 || min > max {
        return Err(ConfigError::BadPitchRange { min, max });
    }
    Ok(())
}

pub fn validate_speed(speed: f64) -> Result<(), ConfigError> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(ConfigError::BadSpeed(speed));
    }
    Ok(())
}

pub fn validate_channel(channel: usize) -> Result<(), ConfigError> {
    if channel >= CHANNEL_COUNT {
        return Err(ConfigError::BadChannel(channel));
    }
    Ok(())
}
