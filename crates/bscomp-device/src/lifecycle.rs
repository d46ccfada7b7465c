use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::error::{DeviceError, StartError};

/// Per-device lifecycle: `Constructed → Running → Halted`.
///
/// `Halted` is terminal. A device that reached it never runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Constructed,
    Running,
    Halted,
}

impl LifecycleState {
    /// Checks that a `start` may proceed from the current state.
    pub fn check_start(self) -> Result<(), StartError> {
        match self {
            LifecycleState::Constructed => Ok(()),
            LifecycleState::Running => Err(StartError::AlreadyRunning),
            LifecycleState::Halted => Err(StartError::Halted),
        }
    }

    pub fn ensure_running(self) -> Result<(), DeviceError> {
        match self {
            LifecycleState::Running => Ok(()),
            _ => Err(DeviceError::NotRunning),
        }
    }

    pub fn is_running(self) -> bool {
        self == LifecycleState::Running
    }

    pub fn is_halted(self) -> bool {
        self == LifecycleState::Halted
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Constructed => "constructed",
            LifecycleState::Running => "running",
            LifecycleState::Halted => "halted",
        };
        f.write_str(s)
    }
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Device state must stay reachable for `stop` even after a panic elsewhere, otherwise resources
/// could never be released.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_only_allowed_from_constructed() {
        assert!(LifecycleState::Constructed.check_start().is_ok());
        assert!(matches!(
            LifecycleState::Running.check_start(),
            Err(StartError::AlreadyRunning)
        ));
        assert!(matches!(
            LifecycleState::Halted.check_start(),
            Err(StartError::Halted)
        ));
    }

    #[test]
    fn operations_require_running() {
        assert_eq!(
            LifecycleState::Constructed.ensure_running(),
            Err(DeviceError::NotRunning)
        );
        assert_eq!(LifecycleState::Running.ensure_running(), Ok(()));
        assert_eq!(
            LifecycleState::Halted.ensure_running(),
            Err(DeviceError::NotRunning)
        );
    }
}
