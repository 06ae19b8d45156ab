//! Bounded-time data-collection worker lifecycle.
//!
//! One worker runs per interval tick. "Fork" is modeled as re-executing the
//! current binary with a hidden flag rather than a literal `fork()`, which
//! would be unsafe to combine with a multi-threaded or async runtime. The
//! parent never holds more than one worker in flight; a tick that lands
//! while a worker is still running is skipped and logged, not queued.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::{Instant, Sleep};

use crate::config::Config;
use crate::icmp::ReachabilityProbe;
use crate::scrubber::{self, ScrubberError};
use crate::store::{Sample, Store};

/// Low two bits of a worker's 8-bit exit status: the exit class. The upper
/// bits carry independent sticky failure flags, set alongside whichever
/// class fits, not instead of it.
const CLASS_MASK: u8 = 0b0000_0011;
const CLASS_SUCCESS: u8 = 0;
const CLASS_GENERAL_FAILURE: u8 = 1;
const CLASS_STORE_FAILURE: u8 = 2;
// bits 2 is reserved.

const FLAG_INTERNET_PROBE_TIMEOUT: u8 = 1 << 2;
const FLAG_MODEM_PROBE_TIMEOUT: u8 = 1 << 3;
const FLAG_SCRUBBER_TIMEOUT: u8 = 1 << 4;
const FLAG_SCRUBBER_FAILURE: u8 = 1 << 5;
const FLAG_SCRUBBER_MALFORMED_OUTPUT: u8 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    GeneralFailure,
    StoreFailure,
    Reserved,
}

/// The worker's 8-bit exit status: a 2-bit exit class plus five independent
/// sticky failure flags, per the worker contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus(u8);

impl WorkerStatus {
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn to_bits(self) -> u8 {
        self.0
    }

    pub fn class(self) -> ExitClass {
        match self.0 & CLASS_MASK {
            CLASS_SUCCESS => ExitClass::Success,
            CLASS_GENERAL_FAILURE => ExitClass::GeneralFailure,
            CLASS_STORE_FAILURE => ExitClass::StoreFailure,
            _ => ExitClass::Reserved,
        }
    }

    pub fn is_success(self) -> bool {
        self.class() == ExitClass::Success
    }

    pub fn internet_probe_timed_out(self) -> bool {
        self.0 & FLAG_INTERNET_PROBE_TIMEOUT != 0
    }

    pub fn modem_probe_timed_out(self) -> bool {
        self.0 & FLAG_MODEM_PROBE_TIMEOUT != 0
    }

    pub fn scrubber_timed_out(self) -> bool {
        self.0 & FLAG_SCRUBBER_TIMEOUT != 0
    }

    pub fn scrubber_failed(self) -> bool {
        self.0 & FLAG_SCRUBBER_FAILURE != 0
    }

    pub fn scrubber_output_malformed(self) -> bool {
        self.0 & FLAG_SCRUBBER_MALFORMED_OUTPUT != 0
    }

    #[must_use]
    fn with_class(mut self, class: u8) -> Self {
        self.0 = (self.0 & !CLASS_MASK) | (class & CLASS_MASK);
        self
    }

    #[must_use]
    fn with_flag(mut self, flag: u8) -> Self {
        self.0 |= flag;
        self
    }
}

/// How the supervisor ultimately accounts for a finished worker: either it
/// ran to completion and returned a worker-contract status, or the process
/// never got the chance to (killed for missing its deadline, or by some
/// other signal before it could exit normally).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Exited(WorkerStatus),
    KilledForTimeout,
    KilledBySignal,
}

/// A worker currently running, tracked by the supervisor's main loop.
pub struct InFlightWorker {
    pub child: Child,
    pub pid: u32,
    pub(crate) deadline: std::pin::Pin<Box<Sleep>>,
}

impl InFlightWorker {
    pub fn spawn(exe: &PathBuf, timeout: Duration) -> std::io::Result<Self> {
        let mut child = Command::new(exe).arg("--worker-child").spawn()?;
        let pid = child.id().expect("freshly spawned child has a pid");
        Ok(Self {
            child,
            pid,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        })
    }

    pub fn reset_deadline(&mut self, timeout: Duration) {
        self.deadline.as_mut().reset(Instant::now() + timeout);
    }

    /// Send SIGKILL. Used when the deadline elapses before natural exit.
    pub fn kill(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    pub async fn reap(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

/// Outcome of racing a worker's natural exit against its timeout deadline.
pub enum WorkerWaitResult {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
}

/// Wait for whichever comes first: the worker's natural exit, or its
/// timeout deadline. Pends forever if no worker is in flight, so this is
/// safe to hold as one branch of a `tokio::select!` alongside other
/// always-present sources.
pub async fn wait_for_worker(worker: &mut Option<InFlightWorker>) -> WorkerWaitResult {
    match worker {
        Some(w) => {
            tokio::select! {
                status = w.child.wait() => WorkerWaitResult::Exited(status),
                _ = w.deadline.as_mut() => WorkerWaitResult::TimedOut,
            }
        }
        None => std::future::pending().await,
    }
}

pub fn classify_exit(status: &std::process::ExitStatus) -> WorkerOutcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return if sig == libc_sigkill() {
                WorkerOutcome::KilledForTimeout
            } else {
                WorkerOutcome::KilledBySignal
            };
        }
    }
    let bits = status.code().unwrap_or(i32::from(CLASS_GENERAL_FAILURE)) as u8;
    WorkerOutcome::Exited(WorkerStatus::from_bits(bits))
}

/// Whether `err` is, at its root, a `tokio` elapsed-deadline error, used to
/// tell a probe timeout apart from every other probe failure.
fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<tokio::time::error::Elapsed>().is_some()
}

#[cfg(unix)]
fn libc_sigkill() -> i32 {
    nix::sys::signal::Signal::SIGKILL as i32
}

/// Entry point for the re-exec'd worker child (invoked from `main` when
/// `--worker-child` is present). Raises `CAP_NET_RAW`, probes reachability,
/// invokes the scrubber, persists the resulting sample, and returns a
/// process exit code per the worker contract: 0 success, 1 probe failure,
/// 2 scrubber failure, >=64 crash.
///
/// The worker is a separate OS process from the supervisor, so it cannot
/// reach into the parent's in-process staging store; it writes straight to
/// the persistent store instead. `StagingMode` governs how the *ancillary*
/// child later batches writes it performs on the supervisor's behalf, not
/// how the worker's own single sample gets there.
pub async fn run_worker_child(
    config: &Config,
    probe: &dyn ReachabilityProbe,
    store: &dyn Store,
) -> i32 {
    if let Err(e) = crate::privilege::raise_net_raw_for_worker() {
        tracing::error!(error = %e, "worker child failed to raise CAP_NET_RAW");
        return i32::from(
            WorkerStatus::from_bits(0)
                .with_class(CLASS_GENERAL_FAILURE)
                .to_bits(),
        );
    }

    let mut status = WorkerStatus::from_bits(0);

    let mut reachable = false;
    for host in &config.ping_hosts {
        match probe.probe(host, config.ping_timeout).await {
            Ok(_) => {
                reachable = true;
                break;
            }
            Err(e) => {
                if is_timeout(&e) {
                    status = status.with_flag(FLAG_INTERNET_PROBE_TIMEOUT);
                }
                tracing::debug!(host, error = %e, "reachability probe failed");
            }
        }
    }
    if !reachable {
        tracing::warn!("no configured host was reachable this tick");
        let sample = Sample {
            collected_at: chrono::Utc::now(),
            reachable: false,
            downstream_power_snr: Vec::new(),
            upstream_power: Vec::new(),
        };
        status = match store.record_sample(&sample).await {
            Ok(()) => status.with_class(CLASS_GENERAL_FAILURE),
            Err(e) => {
                tracing::error!(error = %e, "failed to persist unreachable sample");
                status.with_class(CLASS_STORE_FAILURE)
            }
        };
        return i32::from(status.to_bits());
    }

    if let Err(e) = probe.probe(&config.modem_address, config.ping_timeout).await {
        if is_timeout(&e) {
            status = status.with_flag(FLAG_MODEM_PROBE_TIMEOUT);
        }
        tracing::debug!(error = %e, "modem reachability probe failed");
    }

    let status = match scrubber::run_scrubber(
        &config.scrubber_path,
        &config.modem_address,
        config.scrubber_timeout,
    )
    .await
    {
        Ok(sample) => match store.record_sample(&sample).await {
            Ok(()) => status.with_class(CLASS_SUCCESS),
            Err(e) => {
                tracing::error!(error = %e, "failed to persist sample");
                status.with_class(CLASS_STORE_FAILURE)
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "scrubber invocation failed");
            status
                .with_flag(scrubber_error_flag(&e))
                .with_class(CLASS_GENERAL_FAILURE)
        }
    };
    i32::from(status.to_bits())
}

/// Which sticky flag a scrubber failure sets. Kept separate from
/// `run_worker_child` so the mapping (in particular, that a scrubber
/// timeout sets `FLAG_SCRUBBER_TIMEOUT` rather than folding into the
/// generic `FLAG_SCRUBBER_FAILURE`) is unit-testable without spawning a
/// subprocess.
fn scrubber_error_flag(e: &ScrubberError) -> u8 {
    match e {
        ScrubberError::Timeout => FLAG_SCRUBBER_TIMEOUT,
        ScrubberError::ShortOutput => FLAG_SCRUBBER_MALFORMED_OUTPUT,
        ScrubberError::Spawn(_) | ScrubberError::NonZeroExit(_) => FLAG_SCRUBBER_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[cfg(unix)]
    #[test]
    fn classifies_zero_exit_as_success() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(0);
        match classify_exit(&status) {
            WorkerOutcome::Exited(s) => assert!(s.is_success()),
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn classifies_sigkill_as_timeout() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(libc_sigkill());
        assert_eq!(classify_exit(&status), WorkerOutcome::KilledForTimeout);
    }

    #[test]
    fn status_bits_compose_class_and_sticky_flags() {
        let status = WorkerStatus::from_bits(0)
            .with_class(CLASS_GENERAL_FAILURE)
            .with_flag(FLAG_SCRUBBER_TIMEOUT)
            .with_flag(FLAG_INTERNET_PROBE_TIMEOUT);

        assert_eq!(status.class(), ExitClass::GeneralFailure);
        assert!(status.scrubber_timed_out());
        assert!(status.internet_probe_timed_out());
        assert!(!status.modem_probe_timed_out());
        assert!(!status.scrubber_failed());
        assert!(!status.scrubber_output_malformed());
    }

    // S5: a scrubber timeout sets the dedicated sticky flag, not the
    // generic scrubber-failure flag.
    #[test]
    fn seed_s5_scrubber_timeout_sets_its_own_flag() {
        assert_eq!(scrubber_error_flag(&ScrubberError::Timeout), FLAG_SCRUBBER_TIMEOUT);
    }

    #[test]
    fn round_trips_through_bits() {
        let status = WorkerStatus::from_bits(0)
            .with_class(CLASS_STORE_FAILURE)
            .with_flag(FLAG_SCRUBBER_MALFORMED_OUTPUT);
        let recovered = WorkerStatus::from_bits(status.to_bits());
        assert_eq!(recovered, status);
        assert_eq!(recovered.class(), ExitClass::StoreFailure);
        assert!(recovered.scrubber_output_malformed());
    }

    struct AlwaysUnreachable;

    #[async_trait::async_trait]
    impl ReachabilityProbe for AlwaysUnreachable {
        async fn probe(&self, _host: &str, _timeout: Duration) -> anyhow::Result<Duration> {
            anyhow::bail!("unreachable")
        }
    }

    struct RecordingStore {
        recorded: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Store for RecordingStore {
        async fn record_sample(&self, sample: &Sample) -> anyhow::Result<()> {
            assert!(!sample.reachable);
            self.recorded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn schema_version(&self) -> anyhow::Result<u32> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn unreachable_tick_still_persists_a_sample() {
        let config = Config::default();
        let recorded = Arc::new(AtomicUsize::new(0));
        let store = RecordingStore {
            recorded: recorded.clone(),
        };
        let code = run_worker_child(&config, &AlwaysUnreachable, &store).await;
        assert_eq!(code, 1);
        assert_eq!(recorded.load(Ordering::SeqCst), 1);
    }
}
