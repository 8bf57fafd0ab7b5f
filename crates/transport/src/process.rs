//! Handle to the compile server process, used to notice when it goes away.

use std::process::Child;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ProcessHandle {
    /// A server this process spawned.
    Child(Arc<Mutex<Child>>),
    /// Any other process, probed by pid.
    Pid(u32),
}

impl ProcessHandle {
    pub fn from_child(child: Child) -> Self {
        Self::Child(Arc::new(Mutex::new(child)))
    }

    pub fn from_pid(pid: u32) -> Self {
        Self::Pid(pid)
    }

    /// Handle to the calling process, for servers hosted in-process.
    pub fn current() -> Self {
        Self::Pid(std::process::id())
    }

    pub fn pid(&self) -> u32 {
        match self {
            Self::Child(child) => child.lock().unwrap_or_else(PoisonError::into_inner).id(),
            Self::Pid(pid) => *pid,
        }
    }

    /// Another handle to the same process, kept by a connected session so
    /// the target can still be reached after the caller drops its own.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    pub fn has_exited(&self) -> bool {
        match self {
            Self::Child(child) => {
                let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
                // An error means the child can no longer be waited on
                !matches!(child.try_wait(), Ok(None))
            }
            Self::Pid(pid) => !pid_alive(*pid),
        }
    }

    /// Resolves once the process has exited, checking every `poll_interval`.
    pub async fn exited(&self, poll_interval: Duration) {
        while !self.has_exited() {
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    #[expect(unsafe_code, reason = "kill with signal 0 only probes for existence")]
    let result = unsafe { libc::kill(pid, 0) };
    // EPERM means the process exists but belongs to someone else
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
