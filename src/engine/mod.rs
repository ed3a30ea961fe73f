use crate::model::config::{Modifier, WindowId};

pub mod builder;
pub mod scheduler;
#[cfg(windows)]
pub mod windows;

/// Destination of the generated key events. Implementations must not block:
/// the playback worker calls these on its timing-critical path and treats
/// every dispatch as fire-and-forget.
///
/// `window == None` targets whatever window currently has focus; `Some`
/// addresses synthetic input at that window without requiring focus. A press
/// with a `Shift`/`Ctrl` modifier wraps a transient press/release of the
/// modifier around the key.
pub trait KeySink: Send + Sync {
    fn press(&self, key_code: u32, modifier: Modifier, window: Option<WindowId>);

    fn release(&self, key_code: u32, modifier: Modifier, window: Option<WindowId>);

    /// Safety release of the platform modifier keys (Shift/Ctrl/Alt/Super),
    /// fired as a batch on pause/stop/seek to defend against host-level
    /// stuck modifiers. Sinks without a focus-target release entry point
    /// may leave this a no-op.
    fn release_modifiers(&self) {}
}

/// Sink that discards events after logging them. Useful as the non-Windows
/// default and for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl KeySink for NullSink {
    fn press(&self, key_code: u32, modifier: Modifier, window: Option<WindowId>) {
        log::debug!(
            "press   key={:#04x} mod={:?} window={:?}",
            key_code,
            modifier,
            window
        );
    }

    fn release(&self, key_code: u32, modifier: Modifier, window: Option<WindowId>) {
        log::debug!(
            "release key={:#04x} mod={:?} window={:?}",
            key_code,
            modifier,
            window
        );
    }
}
