//! Deliberate crash injection.
//!
//! These operations exist only to check that an external tool reports
//! unhandled crashes correctly. They are not part of normal error handling.

use std::thread::{self, JoinHandle};

use tracing::warn;

/// Name of the thread used by [`spawn_unhandled_panic`].
pub const CRASH_THREAD_NAME: &str = "uncaught-exception";

/// Panics unconditionally with a recognisable message.
pub fn provoke_unhandled_panic(origin: &str) -> ! {
    panic!("Uncaught exception provoked by {origin}");
}

/// Panics on a fresh thread, outside every catch boundary of the control
/// channel, so the crash reaches the process panic hook.
///
/// Returns `None` if the thread could not be spawned.
pub fn spawn_unhandled_panic(origin: &str) -> Option<JoinHandle<()>> {
    let origin = origin.to_string();
    warn!(%origin, "Provoking an unhandled panic");
    thread::Builder::new()
        .name(CRASH_THREAD_NAME.to_string())
        .spawn(move || provoke_unhandled_panic(&origin))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_panic_surfaces_on_join() {
        let handle = spawn_unhandled_panic("test").unwrap();
        let payload = handle.join().unwrap_err();
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert_eq!(message, "Uncaught exception provoked by test");
    }

    #[test]
    #[should_panic(expected = "provoked by direct")]
    fn direct_panic() {
        provoke_unhandled_panic("direct");
    }
}
