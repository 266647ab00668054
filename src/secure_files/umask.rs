//! Scoped process umask.

use nix::sys::stat::{umask, Mode};
use std::sync::{Mutex, MutexGuard};

/// Umask that forbids every group and other permission bit.
pub const RESTRICTIVE_UMASK: u32 = 0o077;

/// Serializes umask changes across threads; the umask is process-wide.
static UMASK_LOCK: Mutex<()> = Mutex::new(());

/// Sets the process umask for the guard's lifetime.
///
/// The previous umask is restored on drop, which covers early returns,
/// `?` propagation and unwinding alike. Guards must not be nested.
pub struct UmaskGuard {
    previous: Mode,
    _serial: MutexGuard<'static, ()>,
}

impl UmaskGuard {
    pub fn set(mask: u32) -> Self {
        let serial = UMASK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let previous = umask(Mode::from_bits_truncate(mask));
        Self {
            previous,
            _serial: serial,
        }
    }

    /// Umask allowing exactly the permission bits in `mode`.
    pub fn for_mode(mode: u32) -> Self {
        Self::set(!mode & 0o777)
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        // Runs before `_serial` is released.
        umask(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reads the umask; caller must hold `UMASK_LOCK` (directly or via a guard).
    fn peek_umask() -> Mode {
        let mask = umask(Mode::from_bits_truncate(0o022));
        umask(mask);
        mask
    }

    fn current_umask() -> Mode {
        let _serial = UMASK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        peek_umask()
    }

    #[test]
    fn test_guard_sets_and_restores_mask() {
        let before = current_umask();
        {
            let _guard = UmaskGuard::set(RESTRICTIVE_UMASK);
            assert_eq!(peek_umask().bits() & 0o777, 0o077);
        }
        assert_eq!(current_umask(), before);
    }

    #[test]
    fn test_for_mode_forbids_bits_outside_mode() {
        let _guard = UmaskGuard::for_mode(0o711);
        assert_eq!(peek_umask().bits() & 0o777, 0o066);
    }

    #[test]
    fn test_guard_restores_on_unwind() {
        let before = current_umask();
        let result = std::panic::catch_unwind(|| {
            let _guard = UmaskGuard::for_mode(0o700);
            panic!("creation failed");
        });
        assert!(result.is_err());
        assert_eq!(current_umask(), before);
    }
}
