// src/privilege/mod.rs

//! Scoped privilege elevation
//!
//! Fetch, unpack and the executable sections (`setup`, `post`, `files`) run
//! inside [`PrivilegeCoordinator::with_elevated`]. The closure receives an
//! [`ElevatedToken`]; code that needs elevation takes `&ElevatedToken`, so it
//! cannot be called outside a scope.
//!
//! The previous level is restored on every exit path, including unwinding.
//! If restoration fails the coordinator is poisoned and every later request
//! fails with `restore failed`; if it fails while a panic is unwinding the
//! process aborts rather than continue at the wrong level.

mod process;

pub use process::{ProcessPrivilege, Unprivileged};

use crate::error::{Error, PrivilegeCause, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// Effective privilege level (the effective uid)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeLevel(pub u32);

impl PrivilegeLevel {
    pub const ROOT: PrivilegeLevel = PrivilegeLevel(0);

    pub fn is_root(&self) -> bool {
        self.0 == 0
    }
}

/// Low-level privilege switching
pub trait PrivilegeOps: Send + Sync {
    /// Current effective level
    fn current(&self) -> PrivilegeLevel;

    /// Raise to the build level, returning the level to restore later
    fn elevate(&self) -> std::result::Result<PrivilegeLevel, String>;

    /// Return to `previous`
    fn restore(&self, previous: PrivilegeLevel) -> std::result::Result<(), String>;

    /// Whether switching changes process-wide state
    fn process_wide(&self) -> bool {
        true
    }
}

/// Proof that the caller is inside an elevation scope
#[derive(Debug)]
pub struct ElevatedToken {
    level: PrivilegeLevel,
}

impl ElevatedToken {
    /// Level that was in effect before elevation
    pub fn previous_level(&self) -> PrivilegeLevel {
        self.level
    }
}

static PROCESS_SCOPE: AtomicBool = AtomicBool::new(false);

/// Owns the privilege state for one build
pub struct PrivilegeCoordinator {
    ops: Arc<dyn PrivilegeOps>,
    local_scope: AtomicBool,
    poisoned: AtomicBool,
}

impl PrivilegeCoordinator {
    pub fn new(ops: Arc<dyn PrivilegeOps>) -> Self {
        Self {
            ops,
            local_scope: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Coordinator over the real process credentials
    pub fn for_process() -> Result<Self> {
        let ops = ProcessPrivilege::new()
            .map_err(|e| Error::privilege(PrivilegeCause::Denied, e))?;
        Ok(Self::new(Arc::new(ops)))
    }

    /// Coordinator that never switches
    pub fn unprivileged() -> Self {
        Self::new(Arc::new(Unprivileged))
    }

    /// Never switches, after giving up any setuid-root effective uid
    pub fn unprivileged_process() -> Result<Self> {
        let ops = Unprivileged::for_process()
            .map_err(|e| Error::privilege(PrivilegeCause::Denied, e))?;
        Ok(Self::new(Arc::new(ops)))
    }

    pub fn current_level(&self) -> PrivilegeLevel {
        self.ops.current()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn scope_flag(&self) -> &AtomicBool {
        if self.ops.process_wide() {
            &PROCESS_SCOPE
        } else {
            &self.local_scope
        }
    }

    /// Run `f` elevated and restore the previous level afterwards
    pub fn with_elevated<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ElevatedToken) -> Result<T>,
    {
        if self.is_poisoned() {
            return Err(Error::privilege(
                PrivilegeCause::RestoreFailed,
                "an earlier scope failed to restore privileges",
            ));
        }

        if self
            .scope_flag()
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::privilege(
                PrivilegeCause::Reentrant,
                "an elevation scope is already active",
            ));
        }

        let mut guard = ScopeGuard {
            coordinator: self,
            previous: None,
        };

        let previous = self
            .ops
            .elevate()
            .map_err(|e| Error::privilege(PrivilegeCause::Denied, e))?;
        guard.previous = Some(previous);
        debug!("Elevated privileges (previous euid {})", previous.0);

        let token = ElevatedToken { level: previous };
        let result = f(&token);

        if let Err(e) = guard.restore() {
            if let Err(inner) = &result {
                error!("Step error superseded by restore failure: {}", inner);
            }
            return Err(e);
        }
        result
    }
}

/// Restores on drop; releases the scope flag
struct ScopeGuard<'a> {
    coordinator: &'a PrivilegeCoordinator,
    previous: Option<PrivilegeLevel>,
}

impl ScopeGuard<'_> {
    fn restore(&mut self) -> Result<()> {
        let Some(previous) = self.previous.take() else {
            return Ok(());
        };
        match self.coordinator.ops.restore(previous) {
            Ok(()) => {
                debug!("Restored privileges (euid {})", previous.0);
                Ok(())
            }
            Err(e) => {
                self.coordinator.poisoned.store(true, Ordering::SeqCst);
                error!("Failed to restore privileges to euid {}: {}", previous.0, e);
                Err(Error::privilege(PrivilegeCause::RestoreFailed, e))
            }
        }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.restore().is_err() && std::thread::panicking() {
            error!("Cannot restore privileges while unwinding; aborting");
            std::process::abort();
        }
        self.coordinator.scope_flag().store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct MockOps {
        level: AtomicU32,
        deny: bool,
        fail_restore: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl MockOps {
        fn at(level: u32) -> Self {
            let ops = Self::default();
            ops.level.store(level, Ordering::SeqCst);
            ops
        }
    }

    impl PrivilegeOps for MockOps {
        fn current(&self) -> PrivilegeLevel {
            PrivilegeLevel(self.level.load(Ordering::SeqCst))
        }

        fn elevate(&self) -> std::result::Result<PrivilegeLevel, String> {
            self.calls.lock().unwrap().push("elevate");
            if self.deny {
                return Err("not permitted".to_string());
            }
            Ok(PrivilegeLevel(self.level.swap(0, Ordering::SeqCst)))
        }

        fn restore(&self, previous: PrivilegeLevel) -> std::result::Result<(), String> {
            self.calls.lock().unwrap().push("restore");
            if self.fail_restore {
                return Err("stuck".to_string());
            }
            self.level.store(previous.0, Ordering::SeqCst);
            Ok(())
        }

        fn process_wide(&self) -> bool {
            false
        }
    }

    fn coordinator(ops: MockOps) -> (Arc<MockOps>, PrivilegeCoordinator) {
        let ops = Arc::new(ops);
        (ops.clone(), PrivilegeCoordinator::new(ops))
    }

    #[test]
    fn test_level_restored_after_success() {
        let (ops, coord) = coordinator(MockOps::at(1000));
        let seen = coord
            .with_elevated(|token| {
                assert_eq!(token.previous_level(), PrivilegeLevel(1000));
                Ok(ops.current())
            })
            .unwrap();
        assert_eq!(seen, PrivilegeLevel::ROOT);
        assert_eq!(coord.current_level(), PrivilegeLevel(1000));
    }

    #[test]
    fn test_level_restored_after_failure() {
        let (_ops, coord) = coordinator(MockOps::at(1000));
        let result: Result<()> = coord.with_elevated(|_| Err(Error::Cancelled));
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(coord.current_level(), PrivilegeLevel(1000));
    }

    #[test]
    fn test_level_restored_after_panic() {
        let (_ops, coord) = coordinator(MockOps::at(1000));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = coord.with_elevated(|_| panic!("step blew up"));
        }));
        assert!(outcome.is_err());
        assert_eq!(coord.current_level(), PrivilegeLevel(1000));
        // scope released, so a new request works
        assert!(coord.with_elevated(|_| Ok(())).is_ok());
    }

    #[test]
    fn test_denied_skips_closure() {
        let ops = MockOps {
            deny: true,
            ..MockOps::at(1000)
        };
        let (ops, coord) = coordinator(ops);
        let mut ran = false;
        let result = coord.with_elevated(|_| {
            ran = true;
            Ok(())
        });
        assert!(!ran);
        assert!(matches!(
            result,
            Err(Error::Privilege { cause: PrivilegeCause::Denied, .. })
        ));
        assert_eq!(*ops.calls.lock().unwrap(), vec!["elevate"]);
    }

    #[test]
    fn test_nested_request_rejected() {
        let (_ops, coord) = coordinator(MockOps::at(1000));
        let result = coord.with_elevated(|_| coord.with_elevated(|_| Ok(())));
        assert!(matches!(
            result,
            Err(Error::Privilege { cause: PrivilegeCause::Reentrant, .. })
        ));
        assert_eq!(coord.current_level(), PrivilegeLevel(1000));
    }

    #[test]
    fn test_restore_failure_poisons() {
        let ops = MockOps {
            fail_restore: true,
            ..MockOps::at(1000)
        };
        let (_ops, coord) = coordinator(ops);
        let result = coord.with_elevated(|_| Ok(()));
        let err = result.unwrap_err();
        assert!(err.is_fatal_for_process());
        assert!(coord.is_poisoned());

        let again = coord.with_elevated(|_| Ok(()));
        assert!(matches!(
            again,
            Err(Error::Privilege { cause: PrivilegeCause::RestoreFailed, .. })
        ));
    }

    #[test]
    fn test_unprivileged_is_noop() {
        let coord = PrivilegeCoordinator::unprivileged();
        let before = coord.current_level();
        coord.with_elevated(|_| Ok(())).unwrap();
        assert_eq!(coord.current_level(), before);
    }
}
