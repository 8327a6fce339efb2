// src/privilege/process.rs

//! Effective-uid switching for setuid or sudo-launched builds

use super::{PrivilegeLevel, PrivilegeOps};
use nix::unistd::{Uid, geteuid, getuid, seteuid, setresuid};
use tracing::debug;

/// Switches the effective uid between the invoking user and root
///
/// When started setuid-root by a regular user, construction drops the
/// effective uid to the real uid so that only explicit scopes run as root.
/// A process that is fully root treats elevation as already satisfied.
#[derive(Debug)]
pub struct ProcessPrivilege {
    real: Uid,
}

impl ProcessPrivilege {
    pub fn new() -> Result<Self, String> {
        let real = getuid();
        let effective = geteuid();
        if !real.is_root() && effective.is_root() {
            seteuid(real).map_err(|e| format!("cannot drop to uid {}: {}", real, e))?;
            debug!("Dropped effective uid to {} until elevation", real);
        }
        Ok(Self { real })
    }

    pub fn real_uid(&self) -> u32 {
        self.real.as_raw()
    }
}

impl PrivilegeOps for ProcessPrivilege {
    fn current(&self) -> PrivilegeLevel {
        PrivilegeLevel(geteuid().as_raw())
    }

    fn elevate(&self) -> Result<PrivilegeLevel, String> {
        let previous = self.current();
        if previous.is_root() {
            return Ok(previous);
        }
        seteuid(Uid::from_raw(0)).map_err(|e| {
            format!(
                "cannot raise privileges from uid {} (needs setuid root or sudo): {}",
                previous.0, e
            )
        })?;
        Ok(previous)
    }

    fn restore(&self, previous: PrivilegeLevel) -> Result<(), String> {
        if self.current() == previous {
            return Ok(());
        }
        seteuid(Uid::from_raw(previous.0))
            .map_err(|e| format!("seteuid({}) failed: {}", previous.0, e))?;
        if self.current() != previous {
            return Err(format!("effective uid is still {}", self.current().0));
        }
        Ok(())
    }
}

/// Runs everything as the invoking user
#[derive(Debug, Default, Clone, Copy)]
pub struct Unprivileged;

impl Unprivileged {
    /// Give up a setuid-root effective uid for good
    pub fn for_process() -> Result<Self, String> {
        let real = getuid();
        if !real.is_root() && geteuid().is_root() {
            setresuid(real, real, real)
                .map_err(|e| format!("cannot drop to uid {}: {}", real, e))?;
            debug!("Dropped setuid privileges permanently");
        }
        Ok(Self)
    }
}

impl PrivilegeOps for Unprivileged {
    fn current(&self) -> PrivilegeLevel {
        PrivilegeLevel(geteuid().as_raw())
    }

    fn elevate(&self) -> Result<PrivilegeLevel, String> {
        Ok(self.current())
    }

    fn restore(&self, _previous: PrivilegeLevel) -> Result<(), String> {
        Ok(())
    }

    fn process_wide(&self) -> bool {
        false
    }
}
