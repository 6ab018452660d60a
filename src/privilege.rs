//! C4: privilege gatekeeper for setuid deployments.
//!
//! Invariant: the process runs with real uid = caller and effective uid =
//! root at startup (when installed setuid-root), then drops effective uid to
//! the caller for all ordinary I/O, raising it back only for the narrow
//! window a privileged transition actually needs. `with_privileges` owns
//! that window and guarantees restoration on every exit path, including
//! unwind.

use crate::error::{Error, Result};

/// Requested identity for a child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunAs {
    pub user: Option<String>,
    pub group: Option<String>,
}

impl RunAs {
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.group.is_none()
    }
}

/// Resolved numeric identity, looked up from `run_as_user`/`run_as_group`
/// names before the privileged window opens (name resolution itself needs
/// no elevated privilege).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Capability obtained once at startup, threaded through the components
/// that need it rather than stored in a singleton. On a non-setuid build
/// this is inert and every elevation request fails closed.
pub struct PrivilegeCapability {
    available: bool,
    caller_uid: u32,
    caller_gid: u32,
}

impl PrivilegeCapability {
    /// Detect whether we were started setuid-root: effective uid is 0 but
    /// real uid is not.
    pub fn detect() -> Self {
        let ruid = unsafe { libc::getuid() };
        let euid = unsafe { libc::geteuid() };
        let rgid = unsafe { libc::getgid() };
        Self {
            available: euid == 0 && ruid != 0,
            caller_uid: ruid,
            caller_gid: rgid,
        }
    }

    #[cfg(test)]
    pub fn fake(available: bool) -> Self {
        Self {
            available,
            caller_uid: 1000,
            caller_gid: 1000,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Drop effective privileges to the caller's identity for the remainder
    /// of ordinary operation (manifest load, hash verification, file reads).
    /// No-op when privilege was never available.
    pub fn drop_to_caller(&self) -> Result<()> {
        if !self.available {
            return Ok(());
        }
        let ret = unsafe { libc::seteuid(self.caller_uid) };
        if ret != 0 {
            return Err(Error::PrivilegeUnavailable {
                reason: "failed to drop effective uid to caller".into(),
            });
        }
        Ok(())
    }

    /// Run `f` with the effective uid/gid set to the requested identity for
    /// its duration, restoring the prior effective ids on every exit path
    /// (including panic/unwind, via a drop guard).
    pub fn with_privileges<T>(&self, identity: &ResolvedIdentity, f: impl FnOnce() -> T) -> Result<T> {
        if identity.uid.is_none() && identity.gid.is_none() {
            return Ok(f());
        }
        if !self.available {
            return Err(Error::PrivilegeUnavailable {
                reason: "binary was not started setuid-root".into(),
            });
        }

        let prior_euid = unsafe { libc::geteuid() };
        let prior_egid = unsafe { libc::getegid() };

        // Group must be raised before uid is dropped, and dropped after uid
        // is restored, so we always hold root briefly around both calls.
        if let Some(gid) = identity.gid {
            if unsafe { libc::setegid(gid) } != 0 {
                return Err(Error::PrivilegeUnavailable {
                    reason: "failed to set effective gid".into(),
                });
            }
        }
        if let Some(uid) = identity.uid {
            if unsafe { libc::seteuid(uid) } != 0 {
                // best-effort restore of gid before surfacing the error
                unsafe { libc::setegid(prior_egid) };
                return Err(Error::PrivilegeUnavailable {
                    reason: "failed to set effective uid".into(),
                });
            }
        }

        let guard = RestoreGuard {
            euid: prior_euid,
            egid: prior_egid,
        };
        let result = f();
        drop(guard);
        Ok(result)
    }
}

/// Restores effective uid/gid when dropped, including during unwind, so a
/// panicking `f` inside `with_privileges` can never leave the process running
/// with elevated effective ids.
struct RestoreGuard {
    euid: libc::uid_t,
    egid: libc::gid_t,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        unsafe {
            // Restore uid first only if we're lowering it; since callers
            // only ever raise then restore, order here mirrors the raise
            // order in reverse: uid down, then gid down.
            libc::seteuid(self.euid);
            libc::setegid(self.egid);
        }
    }
}

/// Resolve `RunAs` into numeric ids. Open Question (spec §9, (1)):
/// `run_as_group` alone is meaningful and changes only the primary group;
/// if neither name resolves (unknown user/group) this fails closed.
pub fn resolve_identity(run_as: &RunAs, lookup: &dyn UserLookup) -> Result<ResolvedIdentity> {
    let uid = match &run_as.user {
        Some(name) => Some(lookup.uid_for(name).ok_or_else(|| Error::PrivilegeUnavailable {
            reason: format!("no such user '{name}'"),
        })?),
        None => None,
    };
    let gid = match &run_as.group {
        Some(name) => Some(lookup.gid_for(name).ok_or_else(|| Error::PrivilegeUnavailable {
            reason: format!("no such group '{name}'"),
        })?),
        None => None,
    };
    Ok(ResolvedIdentity { uid, gid })
}

/// User/group name resolution, abstracted so tests don't depend on the
/// real `/etc/passwd`.
pub trait UserLookup {
    fn uid_for(&self, name: &str) -> Option<u32>;
    fn gid_for(&self, name: &str) -> Option<u32>;
}

/// Looks up `run_as_user`/`run_as_group` names against the system's real
/// user/group databases via the reentrant `getpwnam_r`/`getgrnam_r` calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsUserLookup;

impl UserLookup for OsUserLookup {
    fn uid_for(&self, name: &str) -> Option<u32> {
        let cname = std::ffi::CString::new(name).ok()?;
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0i8; 16384];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let ret = unsafe {
            libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if ret == 0 && !result.is_null() {
            Some(pwd.pw_uid)
        } else {
            None
        }
    }

    fn gid_for(&self, name: &str) -> Option<u32> {
        let cname = std::ffi::CString::new(name).ok()?;
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut buf = vec![0i8; 16384];
        let mut result: *mut libc::group = std::ptr::null_mut();
        let ret = unsafe {
            libc::getgrnam_r(cname.as_ptr(), &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if ret == 0 && !result.is_null() {
            Some(grp.gr_gid)
        } else {
            None
        }
    }
}

#[cfg(test)]
pub struct FakeUserLookup {
    pub users: std::collections::HashMap<String, u32>,
    pub groups: std::collections::HashMap<String, u32>,
}

#[cfg(test)]
impl UserLookup for FakeUserLookup {
    fn uid_for(&self, name: &str) -> Option<u32> {
        self.users.get(name).copied()
    }
    fn gid_for(&self, name: &str) -> Option<u32> {
        self.groups.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_capability_fails_closed_on_elevation() {
        let cap = PrivilegeCapability::fake(false);
        let identity = ResolvedIdentity { uid: Some(1), gid: None };
        let result = cap.with_privileges(&identity, || 1);
        assert!(matches!(result, Err(Error::PrivilegeUnavailable { .. })));
    }

    #[test]
    fn no_op_when_identity_is_empty() {
        let cap = PrivilegeCapability::fake(false);
        let identity = ResolvedIdentity { uid: None, gid: None };
        let result = cap.with_privileges(&identity, || 42).unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn resolve_identity_group_only_is_meaningful() {
        let lookup = FakeUserLookup {
            users: Default::default(),
            groups: [("wheel".to_string(), 10u32)].into_iter().collect(),
        };
        let run_as = RunAs { user: None, group: Some("wheel".to_string()) };
        let identity = resolve_identity(&run_as, &lookup).unwrap();
        assert_eq!(identity.uid, None);
        assert_eq!(identity.gid, Some(10));
    }

    #[test]
    fn resolve_identity_unknown_user_fails_closed() {
        let lookup = FakeUserLookup { users: Default::default(), groups: Default::default() };
        let run_as = RunAs { user: Some("ghost".to_string()), group: None };
        assert!(resolve_identity(&run_as, &lookup).is_err());
    }

    #[test]
    fn run_as_is_empty_detection() {
        assert!(RunAs::default().is_empty());
        assert!(!RunAs { user: Some("x".into()), group: None }.is_empty());
    }
}
