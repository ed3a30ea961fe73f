use log::info;

/// Parse a pitch range like "48..84", "48-84" or "48:84". Falls back to
/// the given default when the text does not parse or is out of order.
pub fn parse_pitch_range(input: &str, default: (i32, i32)) -> (i32, i32) {
    let cleaned = input.trim();
    let parts: Vec<&str> = if cleaned.contains("..") {
        cleaned.splitn(2, "..").collect()
    } else if cleaned.contains('-') {
        cleaned.splitn(2, '-').collect()
    } else if cleaned.contains(':') {
        cleaned.splitn(2, ':').collect()
    } else {
        Vec::new()
    };

    if parts.len() == 2 {
        if let (Ok(min), Ok(max)) = (parts[0].trim().parse(), parts[1].trim().parse()) {
            if (0..=127).contains(&min) && (0..=127).contains(&max) && min <= max {
                return (min, max);
            }
        }
    }

    info!(
        "Unparseable pitch range '{}', using {}..{}",
        input, default.0, default.1
    );
    default
}

/// Parse a scheduled-start target "mm:ss" (minute and second of the wall
/// clock, both 0..=59).
pub fn parse_schedule(input: &str) -> Option<(u32, u32)> {
    let (minute, second) = input.trim().split_once(':')?;
    let minute: u32 = minute.trim().parse().ok()?;
    let second: u32 = second.trim().parse().ok()?;
    (minute <= 59 && second <= 59).then_some((minute, second))
}

/// "mm:ss" rendering for progress display.
pub fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}
