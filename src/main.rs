use anyhow::{Context, Result};
use clap::Parser;
use keyharp::{
    import_midi_file, parse_pitch_range, parse_schedule, BuildInput, EventBuilder, KeyMap,
    KeySink, NtpClock, RawNote, Scheduler, Song, StartTimer,
};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "keyharp",
    about = "Play a MIDI file as synthetic keyboard input aimed at an application window"
)]
struct Args {
    /// Path to the target MIDI file.
    midi: PathBuf,

    /// Playable pitch range, e.g. "48..84".
    #[arg(short, long, default_value = "48..84")]
    range: String,

    /// Transpose in semitones (-24..=24); 0 picks a per-track octave shift
    /// automatically.
    #[arg(short, long, default_value_t = 0)]
    transpose: i32,

    /// Playback speed multiplier.
    #[arg(short, long, default_value_t = 1.0)]
    speed: f64,

    /// Break chords into staggered single notes.
    #[arg(short, long, default_value_t = false)]
    decompose: bool,

    /// Note-map file; the built-in default layout is used when omitted.
    #[arg(short, long)]
    keymap: Option<PathBuf>,

    /// Print the first events instead of playing.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Maximum events to print in dry run.
    #[arg(long, default_value_t = 80)]
    dry_run_max: usize,

    /// Start playback at the next wall-clock "mm:ss", aligned to NTP time.
    #[arg(long)]
    at: Option<String>,

    /// Latency compensation in microseconds for the scheduled start
    /// (positive fires later, negative earlier).
    #[arg(long, default_value_t = 0)]
    latency_comp_us: i64,

    /// List visible windows and exit (Windows only).
    #[arg(long, default_value_t = false)]
    list_windows: bool,
}

#[cfg(windows)]
fn default_sink() -> Arc<dyn KeySink> {
    Arc::new(keyharp::WindowsKeySink::new())
}

#[cfg(not(windows))]
fn default_sink() -> Arc<dyn KeySink> {
    Arc::new(keyharp::NullSink)
}

fn load_keymap(path: Option<&PathBuf>) -> Result<KeyMap> {
    let mut keymap = KeyMap::default();
    if let Some(path) = path {
        let stats = keymap
            .load_file(path)
            .with_context(|| format!("failed to load note map {}", path.display()))?;
        info!(
            "Loaded note map {}: {} mappings ({} lines skipped)",
            path.display(),
            stats.loaded,
            stats.skipped
        );
    }
    Ok(keymap)
}

fn preview(song: &Song, keymap: &KeyMap, args: &Args) {
    let mut notes: Vec<RawNote> = song.notes_by_track.iter().flatten().copied().collect();
    notes.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));

    let mut histograms = vec![[0u32; 128]; song.tracks.len()];
    for note in &notes {
        if (0..128).contains(&note.pitch) {
            histograms[note.track_index as usize][note.pitch as usize] += 1;
        }
    }

    let (min_pitch, max_pitch) = parse_pitch_range(&args.range, (48, 84));
    let mut channels = [keyharp::ChannelConfig::default(); keyharp::CHANNEL_COUNT];
    channels[0].enabled = true;
    channels[0].transpose_semitones = args.transpose;

    let global = keyharp::GlobalConfig {
        min_pitch,
        max_pitch,
        speed: args.speed,
        decompose: args.decompose,
    };

    let mut builder = EventBuilder::new();
    let stats = builder.rebuild(&BuildInput {
        notes: &notes,
        histograms: &histograms,
        global: &global,
        channels: &channels,
        keymap,
        live_playing: false,
    });

    info!(
        "Previewing at most {} of {} events ({} unmapped notes dropped)",
        args.dry_run_max, stats.events, stats.dropped_unmapped
    );
    for (i, event) in builder.events().iter().take(args.dry_run_max).enumerate() {
        info!(
            "Event {:>4}: {:>9.3}s {:>4?} key={:#04x} mod={:?}",
            i, event.time_s, event.kind, event.key_code, event.modifier
        );
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    #[cfg(windows)]
    if args.list_windows {
        for w in keyharp::list_windows() {
            println!("{:>10} | {:<24} | {}", w.window.0, w.process, w.title);
        }
        return Ok(());
    }
    #[cfg(not(windows))]
    if args.list_windows {
        warn!("--list-windows is only available on Windows");
        return Ok(());
    }

    info!("Importing MIDI file: '{}'...", args.midi.display());
    let song = import_midi_file(&args.midi)?;
    info!(
        "Imported {} tracks, {} notes, {} @ {:.1} bpm",
        song.tracks.len(),
        song.note_count(),
        keyharp::format_time(song.length_s as f64),
        song.initial_bpm
    );

    let keymap = load_keymap(args.keymap.as_ref())?;

    if args.dry_run {
        preview(&song, &keymap, &args);
        return Ok(());
    }

    let (min_pitch, max_pitch) = parse_pitch_range(&args.range, (48, 84));
    let scheduler = Arc::new(Scheduler::new(default_sink()));
    scheduler.set_note_map(keymap);
    scheduler.set_pitch_range(min_pitch, max_pitch);
    scheduler.set_speed(args.speed);
    scheduler.set_decompose(args.decompose);
    scheduler.set_channel_enabled(0, true);
    scheduler.set_channel_transpose(0, args.transpose);
    scheduler.load(song);

    let stopped = Arc::new(AtomicBool::new(false));
    {
        let scheduler = Arc::clone(&scheduler);
        let stopped = Arc::clone(&stopped);
        ctrlc::set_handler(move || {
            warn!("Ctrl-C received, stopping playback");
            scheduler.stop();
            stopped.store(true, Ordering::SeqCst);
        })
        .expect("Error setting Ctrl-C handler");
    }

    // Keep the NTP machinery alive for the whole playback when scheduling.
    let mut ntp: Option<(Arc<NtpClock>, StartTimer)> = None;

    match args.at.as_deref() {
        Some(at) => {
            let (minute, second) = parse_schedule(at)
                .with_context(|| format!("invalid schedule target '{}', expected mm:ss", at))?;
            let clock = Arc::new(NtpClock::new());
            clock.start_auto_sync();

            let timer = StartTimer::new(Arc::clone(&clock));
            timer.set_latency_comp_us(args.latency_comp_us);
            let trigger = Arc::clone(&scheduler);
            let target = timer.arm(minute, second, move || trigger.play());
            info!(
                "Waiting for scheduled start at {:?} (NTP synced: {})",
                target,
                clock.is_synced()
            );
            ntp = Some((clock, timer));
        }
        None => scheduler.play(),
    }

    while !stopped.load(Ordering::SeqCst) && !scheduler.is_finished() {
        std::thread::sleep(Duration::from_millis(50));
    }

    if let Some((clock, timer)) = ntp.take() {
        timer.cancel();
        clock.stop_auto_sync();
    }
    scheduler.shutdown();
    info!("Playback finished, exiting");

    Ok(())
}
