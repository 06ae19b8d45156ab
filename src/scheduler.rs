//! Instrumentation hook for the main-loop dispatch order.
//!
//! Production uses the default [`NoopScheduler`], which never blocks. Tests
//! that need to assert on dispatch ordering (signals before the interval
//! tick, at most one worker reaped per wake, etc.) can supply a
//! [`Scheduler`] that records [`ScheduleEvent`]s as the main loop emits
//! them, without needing to fake real elapsed time.

use std::fmt;

/// Identifies a main-loop step that is about to run.
#[derive(Clone, Debug)]
pub enum Component {
    /// A pending Unix signal is about to be handled.
    Signal { name: &'static str },

    /// The interval ticker fired; a worker fork decision is about to be
    /// made.
    IntervalTick,

    /// The in-flight worker's deadline expired.
    WorkerDeadline { pid: u32 },

    /// The in-flight ancillary child's deadline expired.
    AncillaryDeadline { pid: u32 },

    /// A scheduled event reached its `next_trigger` and is about to be
    /// dispatched.
    ScheduleFire { action: &'static str },
}

/// Events emitted by the supervisor at key state transitions, delivered to
/// the scheduler via [`Scheduler::notify`] for logging and test assertions.
#[derive(Clone, Debug)]
pub enum ScheduleEvent {
    /// A worker was forked.
    WorkerForked { pid: u32 },
    /// A worker exited, successfully or not.
    WorkerReaped { pid: u32, success: bool },
    /// A worker was killed after exceeding its deadline.
    WorkerTimedOut { pid: u32 },
    /// An ancillary child was forked.
    AncillaryForked { pid: u32 },
    /// An ancillary child exited.
    AncillaryReaped { pid: u32, success: bool },
    /// A reconfiguration attempt completed.
    ReloadApplied { accepted: bool },
    /// The suspend/resume latch changed state.
    SuspendedChanged { suspended: bool },
}

/// RAII guard returned by [`Scheduler::acquire`].
///
/// While held, the scheduler knows the component is actively executing.
/// Dropping it signals that the step completed. The default implementation
/// is a no-op; [`ScheduleGuard::on_drop`] attaches test-only bookkeeping.
pub struct ScheduleGuard {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl ScheduleGuard {
    pub fn noop() -> Self {
        Self { on_drop: None }
    }

    pub fn on_drop(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(f)),
        }
    }
}

impl Drop for ScheduleGuard {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

impl fmt::Debug for ScheduleGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleGuard")
            .field("has_callback", &self.on_drop.is_some())
            .finish()
    }
}

/// Controls observability of the main loop's dispatch order.
#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    /// Called immediately before a dispatch step runs.
    async fn acquire(&self, component: Component) -> ScheduleGuard;

    /// Called after a state transition completes.
    fn notify(&self, event: ScheduleEvent);
}

/// The default scheduler: never blocks, ignores all events.
pub struct NoopScheduler;

#[async_trait::async_trait]
impl Scheduler for NoopScheduler {
    async fn acquire(&self, _component: Component) -> ScheduleGuard {
        ScheduleGuard::noop()
    }

    fn notify(&self, _event: ScheduleEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct RecordingScheduler {
        pub events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Scheduler for RecordingScheduler {
        async fn acquire(&self, _component: Component) -> ScheduleGuard {
            ScheduleGuard::noop()
        }

        fn notify(&self, event: ScheduleEvent) {
            self.events.lock().unwrap().push(format!("{event:?}"));
        }
    }

    #[tokio::test]
    async fn noop_scheduler_never_blocks() {
        let scheduler = NoopScheduler;
        let _guard = scheduler.acquire(Component::IntervalTick).await;
        scheduler.notify(ScheduleEvent::WorkerForked { pid: 1 });
    }

    #[tokio::test]
    async fn recording_scheduler_captures_events_in_order() {
        let scheduler = RecordingScheduler::default();
        scheduler.notify(ScheduleEvent::WorkerForked { pid: 7 });
        scheduler.notify(ScheduleEvent::WorkerReaped {
            pid: 7,
            success: true,
        });
        let events = scheduler.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("WorkerForked"));
    }
}
