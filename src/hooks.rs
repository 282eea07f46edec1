//! User hook points fired around the worker lifecycle.
//!
//! Hooks run in the process where the event happens: fork-side hooks in the
//! master (or the mold, for mold-spawned workers), boot/shutdown hooks in the
//! worker, refork hooks in the mold. A panicking hook is logged and does not
//! abort the surrounding loop.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Context passed to every hook: the worker index the event concerns and a
/// mutable string map that persists across hooks within one process.
pub struct HookContext<'a> {
    pub index: usize,
    pub hook_data: &'a mut HashMap<String, String>,
}

/// A lifecycle hook.
pub type Hook = Box<dyn Fn(&mut HookContext<'_>) + Send + Sync>;

/// A master lifecycle event callback.
pub type Event = Box<dyn Fn() + Send + Sync>;

/// Identifies a hook slot; see [`Hooks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    BeforeFork,
    BeforeWorkerFork,
    AfterWorkerFork,
    BeforeWorkerBoot,
    BeforeRefork,
    AfterRefork,
    OnMoldPromotion,
    OnMoldShutdown,
    BeforeWorkerShutdown,
}

/// The full set of user hooks, all optional.
#[derive(Default)]
pub struct Hooks {
    pub before_fork: Option<Hook>,
    pub before_worker_fork: Option<Hook>,
    pub after_worker_fork: Option<Hook>,
    pub before_worker_boot: Option<Hook>,
    pub before_refork: Option<Hook>,
    pub after_refork: Option<Hook>,
    pub on_mold_promotion: Option<Hook>,
    pub on_mold_shutdown: Option<Hook>,
    pub before_worker_shutdown: Option<Hook>,
    /// Fired when every worker of the current generation has booted.
    pub on_booted: Option<Event>,
    /// Fired after the cluster has stopped all workers.
    pub on_stopped: Option<Event>,
}

impl Hooks {
    /// Run the hook registered at `point`, if any.
    pub fn fire(&self, point: HookPoint, index: usize, hook_data: &mut HashMap<String, String>) {
        let slot = match point {
            HookPoint::BeforeFork => &self.before_fork,
            HookPoint::BeforeWorkerFork => &self.before_worker_fork,
            HookPoint::AfterWorkerFork => &self.after_worker_fork,
            HookPoint::BeforeWorkerBoot => &self.before_worker_boot,
            HookPoint::BeforeRefork => &self.before_refork,
            HookPoint::AfterRefork => &self.after_refork,
            HookPoint::OnMoldPromotion => &self.on_mold_promotion,
            HookPoint::OnMoldShutdown => &self.on_mold_shutdown,
            HookPoint::BeforeWorkerShutdown => &self.before_worker_shutdown,
        };
        let Some(hook) = slot else { return };

        let mut ctx = HookContext { index, hook_data };
        if catch_unwind(AssertUnwindSafe(|| hook(&mut ctx))).is_err() {
            tracing::warn!(?point, index, "hook panicked; continuing");
        }
    }

    /// Run a master lifecycle event callback.
    pub fn fire_event(&self, event: &Option<Event>) {
        let Some(callback) = event else { return };
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            tracing::warn!("event callback panicked; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fire_runs_registered_hook() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let hooks = Hooks {
            before_worker_boot: Some(Box::new(move |ctx| {
                seen_clone.store(ctx.index, Ordering::SeqCst);
                ctx.hook_data
                    .insert("booted".to_string(), "yes".to_string());
            })),
            ..Default::default()
        };

        let mut data = HashMap::new();
        hooks.fire(HookPoint::BeforeWorkerBoot, 7, &mut data);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(data.get("booted").map(String::as_str), Some("yes"));
    }

    #[test]
    fn test_fire_missing_hook_is_noop() {
        let hooks = Hooks::default();
        let mut data = HashMap::new();
        hooks.fire(HookPoint::OnMoldPromotion, 0, &mut data);
        assert!(data.is_empty());
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let hooks = Hooks {
            before_refork: Some(Box::new(|_| panic!("boom"))),
            ..Default::default()
        };
        let mut data = HashMap::new();
        hooks.fire(HookPoint::BeforeRefork, 0, &mut data);
    }

    #[test]
    fn test_fire_event() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let hooks = Hooks {
            on_booted: Some(Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        hooks.fire_event(&hooks.on_booted);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
