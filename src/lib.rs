mod engine;
mod midi_parser;
mod model;
mod ntp;
mod schedule;
mod util;

pub use engine::builder::*;
pub use engine::scheduler::*;
#[cfg(windows)]
pub use engine::windows::{list_windows, WindowInfo, WindowsKeySink};
pub use engine::{KeySink, NullSink};
pub use midi_parser::*;
pub use model::config::*;
pub use model::keymap::*;
pub use model::song::*;
pub use ntp::*;
pub use schedule::*;
pub use util::*;
