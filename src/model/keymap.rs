use crate::model::config::{KeyBinding, Modifier};
use log::{debug, warn};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Printable key name <-> virtual-key code table. Codes are the Win32
/// virtual-key values; other sinks are free to reinterpret them as long as
/// they agree with the note-map author.
const KEY_NAMES: &[(&str, u32)] = &[
    ("a", 0x41),
    ("b", 0x42),
    ("c", 0x43),
    ("d", 0x44),
    ("e", 0x45),
    ("f", 0x46),
    ("g", 0x47),
    ("h", 0x48),
    ("i", 0x49),
    ("j", 0x4A),
    ("k", 0x4B),
    ("l", 0x4C),
    ("m", 0x4D),
    ("n", 0x4E),
    ("o", 0x4F),
    ("p", 0x50),
    ("q", 0x51),
    ("r", 0x52),
    ("s", 0x53),
    ("t", 0x54),
    ("u", 0x55),
    ("v", 0x56),
    ("w", 0x57),
    ("x", 0x58),
    ("y", 0x59),
    ("z", 0x5A),
    ("0", 0x30),
    ("1", 0x31),
    ("2", 0x32),
    ("3", 0x33),
    ("4", 0x34),
    ("5", 0x35),
    ("6", 0x36),
    ("7", 0x37),
    ("8", 0x38),
    ("9", 0x39),
    ("[", 0xDB),
    ("]", 0xDD),
    ("\\", 0xDC),
    ("'", 0xDE),
    ("-", 0xBD),
    ("=", 0xBB),
    ("+", 0xBB),
    ("/", 0xBF),
    (",", 0xBC),
    (".", 0xBE),
    (";", 0xBA),
    ("`", 0xC0),
];

pub fn key_code_for_name(name: &str) -> Option<u32> {
    KEY_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, code)| *code)
}

pub fn key_name_for_code(code: u32) -> Option<&'static str> {
    // "=" comes before "+" for the shared 0xBB code.
    KEY_NAMES
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(n, _)| *n)
}

const NOTE_LETTERS: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// "C4", "C#4", "Eb4" style spelling for a MIDI pitch (middle C = C4).
pub fn note_name(pitch: i32) -> String {
    if !(0..=127).contains(&pitch) {
        return String::new();
    }
    let octave = pitch / 12 - 1;
    format!("{}{}", NOTE_LETTERS[(pitch % 12) as usize], octave)
}

/// Parse a note name back into a MIDI pitch. Case-insensitive, accepts
/// `#` or `b` accidentals and negative octaves down to C-1 (pitch 0).
pub fn pitch_from_name(name: &str) -> Option<i32> {
    let mut chars = name.trim().chars().peekable();
    let letter = chars.next()?.to_ascii_uppercase();
    let base = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let mut semitone = base;
    if let Some(&c) = chars.peek() {
        if c == '#' {
            semitone += 1;
            chars.next();
        } else if c == 'b' || c == 'B' {
            semitone -= 1;
            chars.next();
        }
    }
    let octave_str: String = chars.collect();
    let octave: i32 = octave_str.trim().parse().ok()?;
    let pitch = (octave + 1) * 12 + semitone;
    if (0..=127).contains(&pitch) {
        Some(pitch)
    } else {
        None
    }
}

#[derive(Error, Debug)]
pub enum MapLoadError {
    #[error("failed to read key map file: {0}")]
    Io(#[from] std::io::Error),
    #[error("no valid mappings found")]
    NoValidEntries,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub loaded: usize,
    pub skipped: usize,
}

/// The note map: MIDI pitch -> key binding. Backed by a dense 128-slot
/// array so the builder's lookup is a plain index.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyMap {
    slots: [Option<KeyBinding>; 128],
}

impl Default for KeyMap {
    fn default() -> Self {
        let mut map = Self::empty();
        map.install_default();
        map
    }
}

impl KeyMap {
    pub fn empty() -> Self {
        Self { slots: [None; 128] }
    }

    pub fn get(&self, pitch: i32) -> Option<KeyBinding> {
        if (0..=127).contains(&pitch) {
            self.slots[pitch as usize]
        } else {
            None
        }
    }

    pub fn set(&mut self, pitch: i32, binding: KeyBinding) {
        if (0..=127).contains(&pitch) {
            self.slots[pitch as usize] = Some(binding);
        }
    }

    pub fn clear(&mut self, pitch: i32) {
        if (0..=127).contains(&pitch) {
            self.slots[pitch as usize] = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, KeyBinding)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(p, b)| b.map(|b| (p as i32, b)))
    }

    /// Restore the built-in default layout (pitches 48..=84).
    pub fn reset(&mut self) {
        self.slots = [None; 128];
        self.install_default();
    }

    fn install_default(&mut self) {
        let plain = |c: char| KeyBinding {
            key_code: c as u32,
            modifier: Modifier::None,
        };
        let oem = |code: u32| KeyBinding {
            key_code: code,
            modifier: Modifier::None,
        };

        // Low octave.
        self.slots[48] = Some(plain('I'));
        self.slots[49] = Some(plain('8'));
        self.slots[50] = Some(plain('O'));
        self.slots[51] = Some(plain('9'));
        self.slots[52] = Some(plain('P'));
        self.slots[53] = Some(oem(0xDB)); // [
        self.slots[54] = Some(plain('0'));
        self.slots[55] = Some(oem(0xDD)); // ]
        self.slots[56] = Some(oem(0xBD)); // -
        self.slots[57] = Some(oem(0xDC)); // backslash
        self.slots[58] = Some(oem(0xBB)); // =
        self.slots[59] = Some(oem(0xDE)); // '

        // Middle octave.
        self.slots[60] = Some(plain('Q'));
        self.slots[61] = Some(plain('2'));
        self.slots[62] = Some(plain('W'));
        self.slots[63] = Some(plain('3'));
        self.slots[64] = Some(plain('E'));
        self.slots[65] = Some(plain('R'));
        self.slots[66] = Some(plain('5'));
        self.slots[67] = Some(plain('T'));
        self.slots[68] = Some(plain('6'));
        self.slots[69] = Some(plain('Y'));
        self.slots[70] = Some(plain('7'));
        self.slots[71] = Some(plain('U'));

        // High octave.
        self.slots[72] = Some(plain('Z'));
        self.slots[73] = Some(plain('S'));
        self.slots[74] = Some(plain('X'));
        self.slots[75] = Some(plain('D'));
        self.slots[76] = Some(plain('C'));
        self.slots[77] = Some(plain('V'));
        self.slots[78] = Some(plain('G'));
        self.slots[79] = Some(plain('B'));
        self.slots[80] = Some(plain('H'));
        self.slots[81] = Some(plain('N'));
        self.slots[82] = Some(plain('J'));
        self.slots[83] = Some(plain('M'));
        self.slots[84] = Some(oem(0xBF)); // /
    }

    /// Parse a note-map text. Replaces the current map only if at least one
    /// line parsed; unknown lines are skipped and counted.
    pub fn load_str(&mut self, text: &str) -> Result<LoadStats, MapLoadError> {
        let mut slots: [Option<KeyBinding>; 128] = [None; 128];
        let mut stats = LoadStats::default();

        for (line_no, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') || line.starts_with('-') {
                continue;
            }

            match parse_line(line) {
                Some((pitch, binding)) => {
                    slots[pitch as usize] = Some(binding);
                    stats.loaded += 1;
                }
                None => {
                    stats.skipped += 1;
                    warn!("skipping unparseable note-map line {}: {:?}", line_no + 1, line);
                }
            }
        }

        if stats.loaded == 0 {
            return Err(MapLoadError::NoValidEntries);
        }
        self.slots = slots;
        debug!(
            "note map loaded: {} mappings, {} lines skipped",
            stats.loaded, stats.skipped
        );
        Ok(stats)
    }

    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<LoadStats, MapLoadError> {
        let bytes = fs::read(path.as_ref())?;
        self.load_str(&decode_text(&bytes))
    }

    /// Emit the map in the same text format `load_str` accepts, with a
    /// commented header documenting the grammar.
    pub fn save_string(&self) -> String {
        let mut out = String::new();
        out.push_str("################################################################\n");
        out.push_str("# Note-to-key map\n");
        out.push_str("#\n");
        out.push_str("# One mapping per line: <pitch> <separator> <key>\n");
        out.push_str("#   pitch:     MIDI number (60) or note name (C4, C#4, Eb4)\n");
        out.push_str("#   separator: ':', '=', '-' or whitespace (full-width forms accepted)\n");
        out.push_str("#   key:       a printable key name; append '+' for Shift, '-' for Ctrl\n");
        out.push_str("# Lines starting with '#' or '-' are comments.\n");
        out.push_str("################################################################\n");
        out.push('\n');

        for (pitch, binding) in self.iter() {
            let Some(name) = key_name_for_code(binding.key_code) else {
                continue;
            };
            let suffix = match binding.modifier {
                Modifier::None => "",
                Modifier::Shift => "+",
                Modifier::Ctrl => "-",
            };
            out.push_str(&format!(
                "{} ({}): {}{}\n",
                pitch,
                note_name(pitch),
                name,
                suffix
            ));
        }
        out
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        // UTF-8 BOM so editors on every platform pick the right encoding.
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(self.save_string().as_bytes());
        fs::write(path, bytes)
    }
}

/// Decode note-map bytes: strip a UTF-8 BOM if present, then take the text
/// as UTF-8 with a lossy fallback for legacy single-byte encodings.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = match bytes {
        [0xEF, 0xBB, 0xBF, rest @ ..] => rest,
        _ => bytes,
    };
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn normalize(line: &str) -> String {
    line.chars()
        .map(|c| match c {
            '：' => ':',
            '＝' => '=',
            '－' => '-',
            '＋' => '+',
            '　' => ' ',
            '（' => '(',
            '）' => ')',
            other => other,
        })
        .collect()
}

fn is_separator(c: char) -> bool {
    matches!(c, ':' | '=' | '-' | ' ' | '\t')
}

fn parse_line(line: &str) -> Option<(i32, KeyBinding)> {
    let line = normalize(line);
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;

    // Pitch: a run of digits, or a note name.
    let pitch = if chars[i].is_ascii_digit() {
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        let num: String = chars[start..i].iter().collect();
        num.parse::<i32>().ok().filter(|p| (0..=127).contains(p))?
    } else {
        let start = i;
        i += 1; // note letter
        if i < chars.len() && matches!(chars[i], '#' | 'b' | 'B') {
            i += 1;
        }
        if i < chars.len() && chars[i] == '-' {
            i += 1; // negative octave
        }
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        let name: String = chars[start..i].iter().collect();
        pitch_from_name(&name)?
    };

    // Optional parenthesized comment after the pitch, e.g. "60 (C4): q".
    let mut j = i;
    while j < chars.len() && chars[j].is_whitespace() {
        j += 1;
    }
    if j < chars.len() && chars[j] == '(' {
        while j < chars.len() && chars[j] != ')' {
            j += 1;
        }
        if j == chars.len() {
            return None;
        }
        j += 1;
        i = j;
    }

    // At least one separator. Greedy, but back off one char when the line
    // ends in separators so "56: -" still yields the '-' key.
    let sep_start = i;
    while i < chars.len() && is_separator(chars[i]) {
        i += 1;
    }
    if i == sep_start {
        return None;
    }
    if i == chars.len() {
        if i - sep_start >= 2 {
            i -= 1;
        } else {
            return None;
        }
    }

    // Key token: first non-whitespace run.
    let tok_start = i;
    while i < chars.len() && !chars[i].is_whitespace() {
        i += 1;
    }
    let token: String = chars[tok_start..i].iter().collect::<String>().to_lowercase();
    if token.is_empty() {
        return None;
    }

    let (key_part, modifier) = if token.chars().count() > 1 {
        match token.chars().last() {
            Some('+') => (token[..token.len() - 1].to_owned(), Modifier::Shift),
            Some('-') => (token[..token.len() - 1].to_owned(), Modifier::Ctrl),
            _ => (token, Modifier::None),
        }
    } else {
        (token, Modifier::None)
    };

    let key_code = key_code_for_name(key_part.trim())?;
    Some((pitch, KeyBinding { key_code, modifier }))
}
