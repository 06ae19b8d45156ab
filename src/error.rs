//! Error taxonomy.
//!
//! Four kinds, matching how the main loop needs to react: a configuration
//! problem aborts startup (or a reload) with a clear message; a
//! resource-acquisition failure is fatal at startup but not during a
//! reload; a per-tick failure is logged and the loop carries on; a
//! programming-defect error means the invariant checker found a state that
//! should be unreachable and the process should not limp forward pretending
//! otherwise.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to acquire required resource: {0}")]
    ResourceAcquisition(#[source] anyhow::Error),

    #[error("recoverable failure during tick: {0}")]
    Recoverable(#[source] anyhow::Error),

    #[error("invariant violated (this is a bug): {0}")]
    ProgrammingDefect(String),
}

impl SupervisorError {
    /// Process exit code this error should produce if it escapes startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Configuration(_) => 1,
            SupervisorError::ResourceAcquisition(_) => 2,
            SupervisorError::Recoverable(_) => 3,
            SupervisorError::ProgrammingDefect(_) => 70, // EX_SOFTWARE
        }
    }

    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        SupervisorError::Recoverable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        SupervisorError::ResourceAcquisition(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let codes = [
            SupervisorError::Configuration("x".into()).exit_code(),
            SupervisorError::ResourceAcquisition(anyhow::anyhow!("x")).exit_code(),
            SupervisorError::Recoverable(anyhow::anyhow!("x")).exit_code(),
            SupervisorError::ProgrammingDefect("x".into()).exit_code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }
}
