//! Privilege and capability state machine.
//!
//! Three transitions: a one-time permanent drop of root privileges at
//! startup, a per-fork re-raise of the single capability a worker needs
//! (`CAP_NET_RAW`, for ICMP echo sockets), and a no-op reload transition —
//! there is deliberately no path back to elevated privileges once the
//! startup drop has happened.

use crate::error::SupervisorError;

#[cfg(target_os = "linux")]
mod linux {
    use super::SupervisorError;
    use caps::{CapSet, Capability};
    use nix::unistd::{Gid, Group, Uid, User};

    /// Permanently drop to `username`'s uid/gid, narrowing ancillary groups
    /// to that account's primary group and the capability sets to exactly
    /// `CAP_NET_RAW`. Must run exactly once, before the main loop starts.
    pub fn drop_privileges(username: &str) -> Result<(), SupervisorError> {
        if !Uid::effective().is_root() {
            tracing::warn!(
                "not running as root; cannot drop to user \"{username}\", continuing as-is"
            );
            return Ok(());
        }

        let user = User::from_name(username)
            .map_err(|e| SupervisorError::fatal(anyhow::anyhow!("getpwnam({username}): {e}")))?
            .ok_or_else(|| {
                SupervisorError::Configuration(format!("user \"{username}\" does not exist"))
            })?;

        // Keep the permitted capability set across the uid switch so it can
        // be narrowed afterward instead of lost outright.
        caps::securebits::set_keepcaps(true)
            .map_err(|e| SupervisorError::fatal(anyhow::anyhow!("set_keepcaps: {e}")))?;

        nix::unistd::setgroups(&[user.gid])
            .map_err(|e| SupervisorError::fatal(anyhow::anyhow!("setgroups: {e}")))?;
        nix::unistd::setresgid(user.gid, user.gid, user.gid)
            .map_err(|e| SupervisorError::fatal(anyhow::anyhow!("setresgid: {e}")))?;
        nix::unistd::setresuid(user.uid, user.uid, user.uid)
            .map_err(|e| SupervisorError::fatal(anyhow::anyhow!("setresuid: {e}")))?;

        let mut only_net_raw = caps::CapsHashSet::new();
        only_net_raw.insert(Capability::CAP_NET_RAW);
        for set in [CapSet::Permitted, CapSet::Effective, CapSet::Inheritable] {
            caps::set(None, set, &only_net_raw)
                .map_err(|e| SupervisorError::fatal(anyhow::anyhow!("caps::set({set:?}): {e}")))?;
        }

        tracing::info!(
            user = username,
            uid = user.uid.as_raw(),
            gid = user.gid.as_raw(),
            "dropped to unprivileged account, retained CAP_NET_RAW"
        );
        Ok(())
    }

    /// Run in a freshly re-exec'd worker child: raise the effective flag on
    /// `CAP_NET_RAW` so a future raw-socket ICMP prober can open one. The
    /// present reachability probe is a TCP-connect stand-in that needs no
    /// elevated capability at all (see [`crate::icmp`]), so a permitted set
    /// missing `CAP_NET_RAW` is logged and otherwise ignored rather than
    /// treated as fatal; it only becomes a hard requirement once a raw-socket
    /// prober replaces the stand-in.
    pub fn raise_net_raw_for_worker() -> Result<(), SupervisorError> {
        let permitted = caps::read(None, CapSet::Permitted)
            .map_err(|e| SupervisorError::fatal(anyhow::anyhow!("caps::read: {e}")))?;
        if !permitted.contains(&Capability::CAP_NET_RAW) {
            tracing::warn!(
                "CAP_NET_RAW not permitted in worker child; continuing without it since the configured probe doesn't need raw sockets"
            );
            return Ok(());
        }

        let mut effective = caps::read(None, CapSet::Effective)
            .map_err(|e| SupervisorError::fatal(anyhow::anyhow!("caps::read: {e}")))?;
        effective.insert(Capability::CAP_NET_RAW);
        caps::set(None, CapSet::Effective, &effective)
            .map_err(|e| SupervisorError::fatal(anyhow::anyhow!("caps::set: {e}")))?;
        Ok(())
    }

    #[allow(dead_code)]
    fn current_group_name() -> Option<String> {
        Group::from_gid(Gid::current()).ok().flatten().map(|g| g.name)
    }
}

#[cfg(target_os = "linux")]
pub use linux::{drop_privileges, raise_net_raw_for_worker};

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::SupervisorError;

    pub fn drop_privileges(username: &str) -> Result<(), SupervisorError> {
        tracing::warn!(
            "capability management is Linux-only; running as the invoking account instead of \"{username}\""
        );
        Ok(())
    }

    pub fn raise_net_raw_for_worker() -> Result<(), SupervisorError> {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback::{drop_privileges, raise_net_raw_for_worker};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_root_drop_is_a_warning_not_an_error() {
        // This process is never root under the test harness.
        assert!(drop_privileges("nobody").is_ok());
    }
}
