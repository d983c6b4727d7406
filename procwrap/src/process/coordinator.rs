//! Process-wide timeout coordination.
//!
//! Every started [`ProcessHandle`](super::ProcessHandle) joins a coordinator.
//! Instead of one timer per child, the coordinator keeps a single tokio timer
//! task armed for the earliest deadline among its members. When it fires it
//! re-arms first and then gives every member one non-blocking poll; each
//! member decides for itself whether its deadline has passed.
//!
//! Members are held as `Weak` references, so the coordinator never keeps a
//! handle alive and never finalizes one on its own: termination always runs
//! through the handle's own step under the handle's lock.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::handle::HandleCell;

static GLOBAL: OnceLock<Arc<TimeoutCoordinator>> = OnceLock::new();

struct ArmedTimer {
    at: Instant,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    members: HashMap<Uuid, Weak<HandleCell>>,
    timer: Option<ArmedTimer>,
}

/// Coalesces the deadlines of many children into one timer.
pub struct TimeoutCoordinator {
    registry: Mutex<Registry>,
}

impl TimeoutCoordinator {
    /// A private coordinator, independent of the process-wide one.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
        })
    }

    /// The process-wide coordinator used by [`ProcessHandle::new`](super::ProcessHandle::new).
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(Self::new))
    }

    pub(crate) fn register(&self, cell: &Arc<HandleCell>) {
        self.registry
            .lock()
            .members
            .entry(cell.id())
            .or_insert_with(|| Arc::downgrade(cell));
    }

    pub(crate) fn deregister(self: &Arc<Self>, id: Uuid) {
        let removed = self.registry.lock().members.remove(&id).is_some();
        if removed {
            self.recompute_deadline();
        }
    }

    /// Number of live members.
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .members
            .values()
            .filter(|member| member.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Instant the timer is currently armed for.
    pub fn armed_deadline(&self) -> Option<Instant> {
        self.registry.lock().timer.as_ref().map(|timer| timer.at)
    }

    /// Arm the timer for the earliest member deadline, or disarm it.
    ///
    /// Outside a tokio runtime a new timer cannot be started; the current
    /// one is then left in place and re-evaluates on its own firing.
    pub fn recompute_deadline(self: &Arc<Self>) {
        let mut registry = self.registry.lock();
        registry.members.retain(|_, member| member.strong_count() > 0);

        let next = registry
            .members
            .values()
            .filter_map(Weak::upgrade)
            .filter_map(|cell| cell.armed_deadline())
            .min();

        let Some(at) = next else {
            if let Some(timer) = registry.timer.take() {
                timer.task.abort();
                trace!("coordinator timer disarmed");
            }
            return;
        };

        if registry
            .timer
            .as_ref()
            .is_some_and(|timer| timer.at == at && !timer.task.is_finished())
        {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no tokio runtime, coordinator timer left unchanged");
            return;
        };

        if let Some(timer) = registry.timer.take() {
            timer.task.abort();
        }

        let coordinator = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.on_timer_fire();
            }
        });
        trace!(in_ms = at.saturating_duration_since(Instant::now()).as_millis(), "coordinator timer armed");
        registry.timer = Some(ArmedTimer { at, task });
    }

    /// Re-arm, then poll every member once.
    pub fn on_timer_fire(self: &Arc<Self>) {
        {
            let mut registry = self.registry.lock();
            // The firing task is done with its slot; detach rather than
            // abort it, since this may be running inside that very task.
            if registry
                .timer
                .as_ref()
                .is_some_and(|timer| timer.at <= Instant::now())
            {
                registry.timer = None;
            }
        }

        self.recompute_deadline();

        let members: Vec<Arc<HandleCell>> = self
            .registry
            .lock()
            .members
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        trace!(members = members.len(), "coordinator timer fired");
        for cell in members {
            if let Err(error) = cell.step() {
                warn!(handle = %cell.id(), error = %error, "coordinator poll failed");
            }
        }
    }
}
