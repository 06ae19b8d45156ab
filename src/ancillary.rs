//! Staging-flush ancillary child lifecycle.
//!
//! Same shape as [`crate::worker`]'s data-collection worker, in a distinct
//! slot so a slow flush can never block or be confused with a probe tick.
//! Triggered by a scheduled `IMPORTTMPFS` event; bounded by a companion
//! `IMPORTTMPFSTIMEOUT` ONCE event scheduled alongside it.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::{Instant, Sleep};

use crate::staging::StagingStore;
use crate::store::Store;

pub struct InFlightAncillary {
    pub child: Child,
    pub pid: u32,
    pub(crate) deadline: std::pin::Pin<Box<Sleep>>,
}

impl InFlightAncillary {
    pub fn spawn(exe: &PathBuf, timeout: Duration) -> std::io::Result<Self> {
        let mut child = Command::new(exe).arg("--ancillary-child").spawn()?;
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

/// Outcome of racing an ancillary's natural exit against its timeout
/// deadline.
pub enum AncillaryWaitResult {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
}

/// Wait for whichever comes first: the ancillary's natural exit, or its
/// timeout deadline. Pends forever if no ancillary is in flight.
pub async fn wait_for_ancillary(ancillary: &mut Option<InFlightAncillary>) -> AncillaryWaitResult {
    match ancillary {
        Some(a) => {
            tokio::select! {
                status = a.child.wait() => AncillaryWaitResult::Exited(status),
                _ = a.deadline.as_mut() => AncillaryWaitResult::TimedOut,
            }
        }
        None => std::future::pending().await,
    }
}

/// Entry point for the re-exec'd ancillary child. Drains every staged
/// sample into the persistent store. A timeout or a mid-flush error leaves
/// the unflushed rows in the staging store for the next attempt — flush is
/// at-least-once, never exactly-once.
pub async fn run_ancillary_child(staging: &dyn StagingStore, store: &dyn Store) -> i32 {
    let batch = staging.drain();
    if batch.is_empty() {
        return 0;
    }

    let mut flushed = 0usize;
    for sample in &batch {
        match store.record_sample(sample).await {
            Ok(()) => flushed += 1,
            Err(e) => {
                tracing::warn!(error = %e, flushed, total = batch.len(), "staging flush failed partway");
                // Put back what never made it to the store.
                staging.requeue(&batch[flushed..]);
                return 2;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::InMemoryStagingStore;
    use crate::store::Sample;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingStore {
        accepted: Arc<AtomicUsize>,
        fail_after: usize,
    }

    #[async_trait::async_trait]
    impl Store for CountingStore {
        async fn record_sample(&self, _sample: &Sample) -> anyhow::Result<()> {
            let n = self.accepted.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_after {
                anyhow::bail!("simulated store failure");
            }
            Ok(())
        }

        async fn schema_version(&self) -> anyhow::Result<u32> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn flush_requeues_remainder_on_partial_failure() {
        let staging = InMemoryStagingStore::default();
        for i in 0..5 {
            staging.push(Sample::test_sample(i));
        }
        let store = CountingStore {
            accepted: Arc::new(AtomicUsize::new(0)),
            fail_after: 2,
        };

        let code = run_ancillary_child(&staging, &store).await;
        assert_eq!(code, 2);
        assert_eq!(staging.len(), 3);
    }

    #[tokio::test]
    async fn flush_empties_staging_on_full_success() {
        let staging = InMemoryStagingStore::default();
        staging.push(Sample::test_sample(1));
        let store = CountingStore {
            accepted: Arc::new(AtomicUsize::new(0)),
            fail_after: 100,
        };

        let code = run_ancillary_child(&staging, &store).await;
        assert_eq!(code, 0);
        assert_eq!(staging.len(), 0);
    }
}
