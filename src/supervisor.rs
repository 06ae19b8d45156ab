//! Timer/signal multiplexer and top-level orchestration.
//!
//! The main loop is a single `tokio::select!` with a fixed, biased
//! dispatch order: signals, then the interval ticker, then the worker
//! deadline, then the ancillary deadline, then the schedule timer. Biased
//! selection means that if two sources are ready in the same poll, the
//! earlier one in this list always wins, which is what makes the ordering
//! invariants in the test suite meaningful rather than accidental.

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::ancillary::{wait_for_ancillary, AncillaryWaitResult, InFlightAncillary};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::SupervisorError;
use crate::event::{parse_schedule, synthesize_power_on, Action, EventSource};
use crate::heap::EventHeap;
use crate::scheduler::{Component, ScheduleEvent, Scheduler};
use crate::staging::StagingStore;
use crate::store::Store;
use crate::worker::{classify_exit, wait_for_worker, InFlightWorker, WorkerOutcome, WorkerWaitResult};

/// Runtime counters surfaced in the shutdown summary.
#[derive(Debug, Default)]
pub struct Stats {
    pub interval_ticks: AtomicU64,
    pub worker_launches: AtomicU64,
    pub worker_successes: AtomicU64,
    pub scheduled_events_executed: AtomicU64,
}

impl Stats {
    pub fn summary(&self, started_at: i64, clock: &dyn Clock) -> String {
        let uptime = clock.now_epoch() - started_at;
        format!(
            "uptime {} | ticks={} launches={} successes={} scheduled={}",
            crate::time::format_duration(uptime),
            self.interval_ticks.load(Ordering::Relaxed),
            self.worker_launches.load(Ordering::Relaxed),
            self.worker_successes.load(Ordering::Relaxed),
            self.scheduled_events_executed.load(Ordering::Relaxed),
        )
    }
}

/// One-shot latch marking the main loop as done. `Supervisor` never spawns
/// a task or hands this across threads, so a plain `Rc<Cell<bool>>` covers
/// it; polled once per loop iteration rather than woken, since the loop
/// already wakes on every `tokio::select!` branch.
#[derive(Clone)]
struct ShutdownLatch(Rc<Cell<bool>>);

impl ShutdownLatch {
    fn new() -> Self {
        Self(Rc::new(Cell::new(false)))
    }

    fn raise(&self) {
        self.0.set(true);
    }

    fn is_raised(&self) -> bool {
        self.0.get()
    }
}

/// Held for the lifetime of the main loop. Its `Drop` impl guarantees the
/// latch ends up raised even if the loop returns through an error path or
/// unwinds, so nothing downstream can observe a supervisor that has
/// stopped running without the latch reflecting it.
struct ShutdownGuard<'a>(&'a ShutdownLatch);

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        if !self.0.is_raised() {
            tracing::warn!("supervisor main loop returned without the shutdown latch being raised");
        }
        self.0.raise();
    }
}

pub struct Supervisor {
    config: Arc<ArcSwap<Config>>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    store: Arc<dyn Store>,
    staging: Arc<dyn StagingStore>,

    heap: EventHeap,
    worker: Option<InFlightWorker>,
    ancillary: Option<InFlightAncillary>,
    suspended_by_command: bool,
    suspended_by_schedule: bool,

    sighup: Signal,
    sigterm: Signal,
    sigusr1: Signal,

    shutdown: ShutdownLatch,
    stats: Arc<Stats>,
    started_at: i64,
    current_exe: PathBuf,
    argv: Vec<String>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        store: Arc<dyn Store>,
        staging: Arc<dyn StagingStore>,
        current_exe: PathBuf,
        argv: Vec<String>,
    ) -> anyhow::Result<Self> {
        let sighup = signal(SignalKind::hangup())?;
        let sigterm = signal(SignalKind::terminate())?;
        let sigusr1 = signal(SignalKind::user_defined1())?;

        let started_at = clock.now_epoch();
        let mut supervisor = Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            clock,
            scheduler,
            store,
            staging,
            heap: EventHeap::new(),
            worker: None,
            ancillary: None,
            suspended_by_command: false,
            suspended_by_schedule: false,
            sighup,
            sigterm,
            sigusr1,
            shutdown: ShutdownLatch::new(),
            stats: Arc::new(Stats::default()),
            started_at,
            current_exe,
            argv,
        };
        supervisor.rebuild_parsed_events()?;
        Ok(supervisor)
    }

    fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Replace every `PARSED`/`Internal`-auto-generated event with a fresh
    /// set derived from the current configuration's schedule string, while
    /// leaving independently created `INTERNAL` events (staging timers)
    /// untouched.
    fn rebuild_parsed_events(&mut self) -> Result<(), SupervisorError> {
        // Synthesized POWERON companions carry EventSource::Parsed too (they
        // are derived from the schedule string, not created independently of
        // it), so this drain sweeps out stale companions from a previous
        // reload along with the rest of the parsed set before resynthesizing.
        self.heap.drain_source(EventSource::Parsed);
        let config = self.config();
        let outcome = parse_schedule(&config.schedule);
        if !outcome.diagnostics.is_empty() {
            for diag in &outcome.diagnostics {
                tracing::warn!(%diag, "schedule entry rejected");
            }
        }

        let mut events = outcome.events;
        if config.power_control {
            let (synthesized, warnings) =
                synthesize_power_on(&events, config.power_up_delay.as_secs() as i64);
            for warning in warnings {
                tracing::warn!(%warning);
            }
            events.extend(synthesized);
        }

        for mut event in events {
            event.schedule_next(self.clock.as_ref(), config.apply_dst);
            self.heap.insert(event);
        }
        Ok(())
    }

    /// Insert an `INTERNAL INTERVAL IMPORT_STAGING` event, used when the
    /// startup staging-latency test decides staging should be on. Survives
    /// reloads, unlike the schedule-derived `PARSED` events.
    pub fn enable_staging_import(&mut self, period: Duration) {
        let mut event = crate::event::Event {
            next_trigger: 0,
            local_offset: period.as_secs() as i64,
            r#type: crate::event::EventType::Interval,
            action: Action::ImportStaging,
            source: EventSource::Internal,
        };
        event.schedule_next(self.clock.as_ref(), self.config().apply_dst);
        self.heap.insert(event);
    }

    async fn next_schedule_wakeup(heap: &EventHeap, clock: &dyn Clock) {
        match heap.peek() {
            Some(event) => {
                let delay = (event.next_trigger - clock.now_epoch()).max(0);
                clock.sleep(Duration::from_secs(delay as u64)).await
            }
            None => std::future::pending().await,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.config().probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!("supervisor entering main loop");

        // Guarantees the latch is raised no matter which path this function
        // returns through, including an early `?` propagation. Cloning the
        // `Rc` (rather than borrowing `self.shutdown`) avoids pinning an
        // immutable borrow of `self` across the loop body, which otherwise
        // calls several `&mut self` handlers below.
        let shutdown = self.shutdown.clone();
        let _shutdown_guard = ShutdownGuard(&shutdown);

        while !self.shutdown.is_raised() {
            tokio::select! {
                biased;

                _ = self.sighup.recv() => {
                    self.handle_sighup().await;
                }

                _ = self.sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    self.shutdown.raise();
                }

                _ = self.sigusr1.recv() => {
                    tracing::info!(summary = %self.stats.summary(self.started_at, self.clock.as_ref()), "received SIGUSR1");
                }

                _ = interval.tick() => {
                    self.handle_interval_tick().await;
                }

                worker_result = wait_for_worker(&mut self.worker) => {
                    self.handle_worker_result(worker_result).await;
                }

                ancillary_result = wait_for_ancillary(&mut self.ancillary) => {
                    self.handle_ancillary_result(ancillary_result).await;
                }

                _ = Self::next_schedule_wakeup(&self.heap, self.clock.as_ref()) => {
                    self.drain_triggered_schedule_events().await;
                }
            }
        }

        self.graceful_shutdown().await;
        Ok(())
    }

    async fn handle_worker_result(&mut self, result: WorkerWaitResult) {
        let Some(worker) = &mut self.worker else {
            return;
        };
        let pid = worker.pid;
        let _guard = self.scheduler.acquire(Component::WorkerDeadline { pid }).await;

        let outcome = match result {
            WorkerWaitResult::Exited(status) => status.ok().map(|s| classify_exit(&s)),
            WorkerWaitResult::TimedOut => {
                tracing::warn!(pid, "worker exceeded its timeout, sending SIGKILL");
                worker.kill();
                self.scheduler.notify(ScheduleEvent::WorkerTimedOut { pid });
                worker.reap().await.ok().map(|s| classify_exit(&s))
            }
        };

        let success = matches!(outcome, Some(WorkerOutcome::Exited(status)) if status.is_success());
        if success {
            self.stats.worker_successes.fetch_add(1, Ordering::Relaxed);
        }
        self.scheduler
            .notify(ScheduleEvent::WorkerReaped { pid, success });
        tracing::info!(pid, ?outcome, "worker exited");
        self.worker = None;
    }

    async fn handle_ancillary_result(&mut self, result: AncillaryWaitResult) {
        let Some(ancillary) = &mut self.ancillary else {
            return;
        };
        let pid = ancillary.pid;
        let _guard = self
            .scheduler
            .acquire(Component::AncillaryDeadline { pid })
            .await;

        let success = match result {
            AncillaryWaitResult::Exited(status) => status.map(|s| s.success()).unwrap_or(false),
            AncillaryWaitResult::TimedOut => {
                tracing::warn!(pid, "ancillary exceeded its timeout, sending SIGKILL");
                ancillary.kill();
                ancillary
                    .reap()
                    .await
                    .map(|s| s.success())
                    .unwrap_or(false)
            }
        };

        self.scheduler
            .notify(ScheduleEvent::AncillaryReaped { pid, success });
        tracing::info!(pid, success, "ancillary exited");
        self.ancillary = None;
    }

    async fn handle_interval_tick(&mut self) {
        let _guard = self.scheduler.acquire(Component::IntervalTick).await;
        self.stats.interval_ticks.fetch_add(1, Ordering::Relaxed);

        if self.suspended_by_command || self.suspended_by_schedule {
            tracing::debug!("interval tick skipped: suspended");
            return;
        }
        if self.worker.is_some() {
            tracing::warn!("interval tick skipped: previous worker still running");
            return;
        }

        match InFlightWorker::spawn(&self.current_exe, self.config().worker_timeout) {
            Ok(worker) => {
                self.scheduler
                    .notify(ScheduleEvent::WorkerForked { pid: worker.pid });
                self.stats.worker_launches.fetch_add(1, Ordering::Relaxed);
                self.worker = Some(worker);
            }
            Err(e) => tracing::error!(error = %e, "failed to spawn worker"),
        }
    }

    async fn drain_triggered_schedule_events(&mut self) {
        loop {
            let now = self.clock.now_epoch();
            let Some(mut event) = self.heap.fetch_if_triggered(now) else {
                break;
            };

            let _guard = self
                .scheduler
                .acquire(Component::ScheduleFire { action: action_name(event.action) })
                .await;
            self.stats
                .scheduled_events_executed
                .fetch_add(1, Ordering::Relaxed);
            self.execute_scheduled_action(event.action).await;

            if event.r#type != crate::event::EventType::Once {
                event.schedule_next(self.clock.as_ref(), self.config().apply_dst);
                self.heap.insert(event);
            }
        }
    }

    async fn execute_scheduled_action(&mut self, action: Action) {
        match action {
            Action::Suspend => {
                self.suspended_by_schedule = true;
                self.scheduler
                    .notify(ScheduleEvent::SuspendedChanged { suspended: true });
            }
            Action::Resume => {
                self.suspended_by_schedule = false;
                self.scheduler
                    .notify(ScheduleEvent::SuspendedChanged { suspended: false });
            }
            Action::PowerOff | Action::PowerOn => {
                tracing::info!(?action, "power control action (hardware interface out of scope)");
            }
            Action::ImportStaging => {
                if self.ancillary.is_some() {
                    tracing::warn!("staging flush skipped: previous ancillary still running");
                    return;
                }
                match InFlightAncillary::spawn(&self.current_exe, self.config().ancillary_timeout)
                {
                    Ok(ancillary) => {
                        self.scheduler
                            .notify(ScheduleEvent::AncillaryForked { pid: ancillary.pid });
                        self.ancillary = Some(ancillary);
                    }
                    Err(e) => tracing::error!(error = %e, "failed to spawn ancillary"),
                }
            }
            Action::ImportStagingTimeout => {
                // The deadline future on the in-flight ancillary already
                // handles this; this ONCE event exists so the timeout fires
                // even if the ancillary handle was somehow lost.
                if let Some(ancillary) = &mut self.ancillary {
                    tracing::warn!(pid = ancillary.pid, "staging import timeout event fired");
                }
            }
            Action::Watchdog => {
                tracing::debug!("watchdog tick");
            }
        }
    }

    async fn handle_sighup(&mut self) {
        tracing::info!("received SIGHUP, reloading configuration");
        match self.reload().await {
            Ok(()) => {
                self.scheduler
                    .notify(ScheduleEvent::ReloadApplied { accepted: true });
                tracing::info!("reload accepted");
            }
            Err(e) => {
                self.scheduler
                    .notify(ScheduleEvent::ReloadApplied { accepted: false });
                tracing::error!(error = %e, "reload rejected, continuing with previous configuration");
            }
        }
    }

    async fn reload(&mut self) -> Result<(), SupervisorError> {
        let mut candidate = Config::default();
        // Replays the startup argv so command-line overrides continue to
        // win over whatever the config file says after the edit.
        let cli = <crate::config::Cli as clap::Parser>::parse_from(&self.argv);
        if let Some(path) = &cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| SupervisorError::Configuration(format!("{}: {e}", path.display())))?;
            let overrides = crate::config::parse_config_file(&contents)?;
            candidate.apply_overrides(&overrides)?;
        }
        candidate.apply_overrides(&cli.overrides())?;
        candidate.validate()?;

        let old_interval = self.config().probe_interval;
        self.config.store(Arc::new(candidate));
        self.rebuild_parsed_events()?;

        if self.config().probe_interval != old_interval {
            tracing::info!("interval changed, timer will re-arm on next tick boundary");
        }
        Ok(())
    }

    async fn graceful_shutdown(&mut self) {
        tracing::info!(summary = %self.stats.summary(self.started_at, self.clock.as_ref()), "shutting down");
        if let Some(worker) = &mut self.worker {
            let _ = worker.reap().await;
        }
        if let Some(ancillary) = &mut self.ancillary {
            let _ = ancillary.reap().await;
        }
    }
}

fn action_name(action: Action) -> &'static str {
    match action {
        Action::Suspend => "SUSPEND",
        Action::Resume => "RESUME",
        Action::PowerOff => "POWEROFF",
        Action::PowerOn => "POWERON",
        Action::ImportStaging => "IMPORTTMPFS",
        Action::ImportStagingTimeout => "IMPORTTMPFSTIMEOUT",
        Action::Watchdog => "WATCHDOG",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::scheduler::NoopScheduler;
    use crate::staging::InMemoryStagingStore;
    use crate::store::Sample;

    struct NullStore;

    #[async_trait::async_trait]
    impl Store for NullStore {
        async fn record_sample(&self, _sample: &Sample) -> anyhow::Result<()> {
            Ok(())
        }

        async fn schema_version(&self) -> anyhow::Result<u32> {
            Ok(1)
        }
    }

    fn test_supervisor(config: Config) -> Supervisor {
        Supervisor::new(
            config,
            Arc::new(SystemClock),
            Arc::new(NoopScheduler),
            Arc::new(NullStore),
            Arc::new(InMemoryStagingStore::default()),
            PathBuf::from("/bin/true"),
            vec!["icmond".to_string()],
        )
        .expect("constructing a supervisor in-process should not fail")
    }

    #[test]
    fn shutdown_guard_raises_the_latch_on_drop_even_without_an_explicit_raise() {
        let latch = ShutdownLatch::new();
        {
            let _guard = ShutdownGuard(&latch);
            assert!(!latch.is_raised());
        }
        assert!(latch.is_raised());
    }

    #[test]
    fn shutdown_guard_drop_is_idempotent_after_an_explicit_raise() {
        let latch = ShutdownLatch::new();
        {
            let _guard = ShutdownGuard(&latch);
            latch.raise();
        }
        assert!(latch.is_raised());
    }

    #[tokio::test]
    async fn startup_populates_heap_from_configured_schedule() {
        let mut config = Config::default();
        config.schedule = "23:00 SUSPEND, 06:00 RESUME, @00:01 WATCHDOG".to_string();
        let supervisor = test_supervisor(config);
        // SUSPEND, RESUME, WATCHDOG, plus the auto-synthesized POWERON
        // companion only appears when power_control is enabled, which the
        // default config leaves off.
        assert_eq!(supervisor.heap.len(), 3);
    }

    #[tokio::test]
    async fn power_control_synthesizes_a_poweron_companion() {
        let mut config = Config::default();
        config.power_control = true;
        config.schedule = "06:00 RESUME, 23:00 SUSPEND".to_string();
        let supervisor = test_supervisor(config);
        assert_eq!(supervisor.heap.len(), 3);
        let has_poweron = supervisor
            .heap
            .iter_sorted()
            .iter()
            .any(|e| e.action == Action::PowerOn);
        assert!(has_poweron);
    }

    #[tokio::test]
    async fn execute_scheduled_action_toggles_suspend_latch() {
        let mut supervisor = test_supervisor(Config::default());
        assert!(!supervisor.suspended_by_schedule);

        supervisor.execute_scheduled_action(Action::Suspend).await;
        assert!(supervisor.suspended_by_schedule);

        supervisor.execute_scheduled_action(Action::Resume).await;
        assert!(!supervisor.suspended_by_schedule);
    }

    #[tokio::test]
    async fn reload_with_no_config_file_reapplies_compiled_defaults() {
        let mut config = Config::default();
        config.schedule = "@00:01 WATCHDOG".to_string();
        let mut supervisor = test_supervisor(config);
        assert_eq!(supervisor.heap.len(), 1);

        // argv carries no `-config` and no per-key overrides, so reload
        // rebuilds from `Config::default()` — a stand-in here for "the
        // config file's current contents", exercising the same replay path
        // a real SIGHUP takes.
        supervisor.reload().await.expect("reload should succeed");
        assert_eq!(supervisor.config().schedule, Config::default().schedule);
    }

    #[tokio::test]
    async fn reload_does_not_duplicate_the_poweron_companion() {
        let mut config = Config::default();
        config.power_control = true;
        config.schedule = "06:00 RESUME, 23:00 SUSPEND".to_string();
        let mut supervisor = test_supervisor(config);

        supervisor
            .rebuild_parsed_events()
            .expect("rebuild should succeed");
        supervisor
            .rebuild_parsed_events()
            .expect("rebuild should succeed");

        let poweron_count = supervisor
            .heap
            .iter_sorted()
            .iter()
            .filter(|e| e.action == Action::PowerOn)
            .count();
        assert_eq!(poweron_count, 1);
    }

    // S6: reload preserves INTERNAL events untouched.
    #[tokio::test]
    async fn seed_s6_reload_preserves_internal_event() {
        let config = Config::default();
        let mut supervisor = test_supervisor(config);
        let before_len = supervisor.heap.len();

        let internal_trigger = supervisor.clock.now_epoch() + 600;
        supervisor.heap.insert(crate::event::Event {
            next_trigger: internal_trigger,
            local_offset: 600,
            r#type: crate::event::EventType::Once,
            action: Action::ImportStaging,
            source: EventSource::Internal,
        });
        assert_eq!(supervisor.heap.len(), before_len + 1);

        supervisor.argv = vec![
            "icmond".to_string(),
            "--schedule=@00:02 WATCHDOG".to_string(),
        ];
        supervisor.reload().await.expect("reload should succeed");

        let internal_survivors: Vec<_> = supervisor
            .heap
            .iter_sorted()
            .into_iter()
            .filter(|e| e.source == EventSource::Internal)
            .collect();
        assert_eq!(internal_survivors.len(), 1);
        assert_eq!(internal_survivors[0].next_trigger, internal_trigger);
        assert_eq!(internal_survivors[0].action, Action::ImportStaging);
    }

    #[tokio::test]
    async fn reload_rejects_an_invalid_candidate_and_keeps_running() {
        let mut supervisor = test_supervisor(Config::default());
        supervisor.argv = vec!["icmond".to_string(), "--workertimeout=1".to_string()];
        let before = supervisor.config().worker_timeout;

        let result = supervisor.reload().await;
        assert!(result.is_err());
        assert_eq!(supervisor.config().worker_timeout, before);
    }
}
