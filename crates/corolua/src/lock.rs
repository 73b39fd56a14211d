// Host lock guarding the whole state.
//
// The runtime is single-threaded and cooperative; the lock exists so an
// embedding host can serialize entry from several host threads. A plain
// mutex is gated by `lockstate` so nested lock/unlock pairs (which happen
// around every host callback) collapse into the outermost pair.

use std::sync::{Mutex, MutexGuard};

pub struct HostLock {
    mutex: &'static Mutex<()>,
    guard: Option<MutexGuard<'static, ()>>,
    lockstate: bool,
}

// The guard is only ever touched under the owning VM's single-threaded
// discipline.
unsafe impl Send for HostLock {}

impl HostLock {
    pub fn new() -> Self {
        HostLock {
            mutex: Box::leak(Box::new(Mutex::new(()))),
            guard: None,
            lockstate: false,
        }
    }

    /// Acquire unless already held by this state.
    pub fn lock(&mut self) {
        if self.lockstate {
            return;
        }
        let guard = self.mutex.lock().unwrap_or_else(|p| p.into_inner());
        self.guard = Some(guard);
        self.lockstate = true;
    }

    /// Release; a second release is ignored.
    pub fn unlock(&mut self) {
        if !self.lockstate {
            return;
        }
        self.guard = None;
        self.lockstate = false;
    }

    pub fn is_locked(&self) -> bool {
        self.lockstate
    }
}

impl Default for HostLock {
    fn default() -> Self {
        HostLock::new()
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
