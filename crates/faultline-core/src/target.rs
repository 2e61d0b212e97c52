//! Instrumented targets: remotely measurable and activatable UI elements.
//!
//! A [`Target`] is mounted into the [`TargetRegistry`] together with a
//! [`LayoutProbe`] that reports its rendered rectangle. While mounted, the
//! target answers `getPosition:<id>` with a normalized [`Geometry`] and
//! `click:<id>` by running its activation callback.
//!
//! Every activation, remote or physical, goes through
//! [`TargetRegistry::activate`], which emits exactly one `{"action": "<id>"}`
//! notification. An observer of the channel cannot tell the two apart.
//!
//! # Identity
//!
//! Target ids are caller-assigned. Mounting a second target under an id that
//! is already mounted replaces the first one (last mount wins). The displaced
//! [`MountedTarget`] guard becomes inert: dropping it does not unmount the
//! newer target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::debug;

use crate::channel::ControlChannel;
use crate::protocol::{Geometry, Notification};

/// Viewport dimensions used to normalize measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    /// Platform status-bar height added to `y` so the origin matches the
    /// tool's coordinate space.
    pub status_bar_offset: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            status_bar_offset: 0.0,
        }
    }

    pub fn with_status_bar(mut self, offset: f64) -> Self {
        self.status_bar_offset = offset;
        self
    }
}

/// A rectangle in window coordinates (points).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Reports where a target is currently rendered.
pub trait LayoutProbe: Send + Sync {
    /// The target's rectangle in window coordinates, or `None` before the
    /// first layout pass.
    fn measure_in_window(&self) -> Option<Rect>;
}

/// A probe returning a fixed rectangle.
#[derive(Debug, Clone, Copy)]
pub struct FixedLayout(pub Rect);

impl LayoutProbe for FixedLayout {
    fn measure_in_window(&self) -> Option<Rect> {
        Some(self.0)
    }
}

/// A probe whose rectangle is set once layout happens.
#[derive(Debug, Default)]
pub struct DeferredLayout {
    rect: RwLock<Option<Rect>>,
}

impl DeferredLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed layout pass.
    pub fn set(&self, rect: Rect) {
        *self.rect.write().unwrap_or_else(PoisonError::into_inner) = Some(rect);
    }
}

impl LayoutProbe for DeferredLayout {
    fn measure_in_window(&self) -> Option<Rect> {
        *self.rect.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: LayoutProbe + ?Sized> LayoutProbe for Arc<T> {
    fn measure_in_window(&self) -> Option<Rect> {
        (**self).measure_in_window()
    }
}

/// Callback run when a target is activated. Receives the target id.
pub type ActivationCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// An addressable UI element.
#[derive(Clone)]
pub struct Target {
    pub id: String,
    pub title: String,
    on_activate: Option<ActivationCallback>,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

impl Target {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            on_activate: None,
        }
    }

    /// Sets the activation callback.
    pub fn on_activate<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_activate = Some(Arc::new(callback));
        self
    }
}

/// Normalizes a window rectangle against the viewport.
///
/// Returns `None` for rectangles without area (not laid out yet) and for a
/// degenerate viewport. The origin is clamped into `[0, 1]`.
pub fn normalize(id: &str, rect: Rect, viewport: Viewport) -> Option<Geometry> {
    if viewport.width <= 0.0 || viewport.height <= 0.0 {
        return None;
    }
    if rect.width <= 0.0 || rect.height <= 0.0 {
        return None;
    }
    Some(Geometry {
        id: id.to_string(),
        x: (rect.x / viewport.width).clamp(0.0, 1.0),
        y: ((rect.y + viewport.status_bar_offset) / viewport.height).clamp(0.0, 1.0),
        width: rect.width / viewport.width,
        height: rect.height / viewport.height,
    })
}

struct Entry {
    generation: u64,
    target: Target,
    probe: Box<dyn LayoutProbe>,
}

/// All currently mounted targets.
pub struct TargetRegistry {
    channel: ControlChannel,
    viewport: RwLock<Viewport>,
    entries: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

impl TargetRegistry {
    pub fn new(channel: ControlChannel, viewport: Viewport) -> Arc<Self> {
        Arc::new(Self {
            channel,
            viewport: RwLock::new(viewport),
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn viewport(&self) -> Viewport {
        *self.viewport.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates the viewport (rotation, window resize).
    pub fn set_viewport(&self, viewport: Viewport) {
        *self.viewport.write().unwrap_or_else(PoisonError::into_inner) = viewport;
    }

    /// Mounts `target`. The target stays addressable until the returned
    /// guard is dropped.
    pub fn mount(self: &Arc<Self>, target: Target, probe: impl LayoutProbe + 'static) -> MountedTarget {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let id = target.id.clone();
        let previous = self.entries().insert(
            id.clone(),
            Entry {
                generation,
                target,
                probe: Box::new(probe),
            },
        );
        if previous.is_some() {
            debug!(target = %id, "Target id remounted, previous registration replaced");
        }
        MountedTarget {
            id,
            generation,
            registry: Arc::downgrade(self),
        }
    }

    pub fn is_mounted(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    /// Ids of every mounted target, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Measures a mounted target.
    ///
    /// Returns `None` when the target is not mounted or has not been laid
    /// out; callers must then stay silent rather than reply.
    pub fn measure(&self, id: &str) -> Option<Geometry> {
        let rect = {
            let entries = self.entries();
            entries.get(id)?.probe.measure_in_window()?
        };
        normalize(id, rect, self.viewport())
    }

    /// Activates a mounted target: emits the activation echo, then runs the
    /// callback. Returns `false` if no such target is mounted.
    pub fn activate(&self, id: &str) -> bool {
        let callback = {
            let entries = self.entries();
            match entries.get(id) {
                Some(entry) => entry.target.on_activate.clone(),
                None => return false,
            }
        };
        self.channel.send(&Notification::Action {
            action: id.to_string(),
        });
        if let Some(callback) = callback {
            callback(id);
        }
        true
    }

    fn unmount(&self, id: &str, generation: u64) {
        let mut entries = self.entries();
        if entries.get(id).is_some_and(|entry| entry.generation == generation) {
            entries.remove(id);
            debug!(target = %id, "Target unmounted");
        }
    }
}

/// Guard for a mounted target. Dropping it unmounts the target.
pub struct MountedTarget {
    id: String,
    generation: u64,
    registry: Weak<TargetRegistry>,
}

impl MountedTarget {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A physical tap on the target. Indistinguishable from a remote
    /// `click:<id>` to an observer of the channel.
    pub fn tap(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) if self.is_current(&registry) => registry.activate(&self.id),
            _ => false,
        }
    }

    fn is_current(&self, registry: &TargetRegistry) -> bool {
        registry
            .entries()
            .get(&self.id)
            .is_some_and(|entry| entry.generation == self.generation)
    }

    /// Unmounts explicitly. Equivalent to dropping the guard.
    pub fn unmount(self) {}
}

impl Drop for MountedTarget {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unmount(&self.id, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> Arc<TargetRegistry> {
        TargetRegistry::new(
            ControlChannel::new("ws://unused"),
            Viewport::new(400.0, 800.0),
        )
    }

    fn rect(x: f64, y: f64, width: f64, height: f64) -> Rect {
        Rect { x, y, width, height }
    }

    #[test]
    fn normalizes_against_viewport() {
        let geometry = normalize("btn", rect(100.0, 200.0, 200.0, 40.0), Viewport::new(400.0, 800.0))
            .unwrap();
        assert_eq!(geometry.x, 0.25);
        assert_eq!(geometry.y, 0.25);
        assert_eq!(geometry.width, 0.5);
        assert_eq!(geometry.height, 0.05);
    }

    #[test]
    fn status_bar_offset_shifts_y() {
        let viewport = Viewport::new(400.0, 800.0).with_status_bar(40.0);
        let geometry = normalize("btn", rect(0.0, 160.0, 10.0, 10.0), viewport).unwrap();
        assert_eq!(geometry.y, 0.25);
    }

    #[test]
    fn origin_is_clamped_into_unit_range() {
        let geometry = normalize("btn", rect(-40.0, 900.0, 80.0, 20.0), Viewport::new(400.0, 800.0))
            .unwrap();
        assert_eq!(geometry.x, 0.0);
        assert_eq!(geometry.y, 1.0);
        assert!(geometry.width > 0.0);
    }

    #[test]
    fn zero_area_or_viewport_is_not_a_measurement() {
        assert!(normalize("btn", rect(0.0, 0.0, 0.0, 0.0), Viewport::new(400.0, 800.0)).is_none());
        assert!(normalize("btn", rect(0.0, 0.0, 10.0, 10.0), Viewport::new(0.0, 800.0)).is_none());
    }

    #[test]
    fn measure_requires_mount_and_layout() {
        let registry = registry();
        assert!(registry.measure("btn").is_none());

        let layout = Arc::new(DeferredLayout::new());
        let mounted = registry.mount(Target::new("btn", "Button"), layout.clone());
        assert!(registry.measure("btn").is_none(), "no layout pass yet");

        layout.set(rect(0.0, 0.0, 40.0, 80.0));
        assert_eq!(registry.measure("btn").unwrap().height, 0.1);

        drop(mounted);
        assert!(registry.measure("btn").is_none());
    }

    #[test]
    fn activation_runs_callback_once() {
        let registry = registry();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mounted = registry.mount(
            Target::new("btn", "Button").on_activate(move |id| {
                assert_eq!(id, "btn");
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            FixedLayout(rect(0.0, 0.0, 10.0, 10.0)),
        );

        assert!(registry.activate("btn"));
        assert!(mounted.tap());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!registry.activate("missing"));
    }

    #[test]
    fn last_mount_wins_and_stale_guard_is_inert() {
        let registry = registry();
        let first = registry.mount(Target::new("btn", "First"), FixedLayout(rect(0.0, 0.0, 40.0, 40.0)));
        let second = registry.mount(Target::new("btn", "Second"), FixedLayout(rect(0.0, 0.0, 80.0, 80.0)));

        assert_eq!(registry.measure("btn").unwrap().width, 0.2);
        assert!(!first.tap(), "displaced guard must not activate");

        drop(first);
        assert!(registry.is_mounted("btn"), "stale guard must not unmount newer target");

        drop(second);
        assert!(!registry.is_mounted("btn"));
    }

    #[test]
    fn ids_are_sorted() {
        let registry = registry();
        let _b = registry.mount(Target::new("b", "B"), FixedLayout(rect(0.0, 0.0, 1.0, 1.0)));
        let _a = registry.mount(Target::new("a", "A"), FixedLayout(rect(0.0, 0.0, 1.0, 1.0)));
        assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
    }
}
