//! Process status word, signal-driven cancellation, and the
//! secondary-thread census.
//!
//! One atomic word shared by every thread in the pipeline. Any thread may
//! move it from Running to Aborted or Failed; nobody ever moves it back.
//! SIGINT/SIGTERM are observed by a signal handler that flips a flag;
//! [`Status::get`] folds that flag into the visible state so that every
//! blocking loop notices a pending abort within its one-second timeout.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{FsaError, FsaResult};

/// Timeout used by every blocking wait so status can be polled.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunState {
    /// Normal operation.
    Running = 0,
    /// The user asked to stop (signal); threads drain and exit.
    Aborted = 1,
    /// A thread hit a fatal error; threads drain and exit.
    Failed = 2,
    /// The main thread has everything it needs.
    Finished = 3,
}

impl RunState {
    fn from_u32(v: u32) -> RunState {
        match v {
            0 => RunState::Running,
            1 => RunState::Aborted,
            2 => RunState::Failed,
            _ => RunState::Finished,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Aborted => "aborted",
            RunState::Failed => "failed",
            RunState::Finished => "finished",
        }
    }
}

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate_signal(_sig: libc::c_int) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that request an abort.
///
/// Call once from the main thread before spawning the pipeline.
pub fn install_signal_handlers() -> FsaResult<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_terminate_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)
            .map_err(|e| FsaError::Unknown(format!("sigaction(SIGINT): {e}")))?;
        sigaction(Signal::SIGTERM, &action)
            .map_err(|e| FsaError::Unknown(format!("sigaction(SIGTERM): {e}")))?;
    }
    Ok(())
}

/// Shared run status + census of secondary threads.
#[derive(Debug, Default)]
pub struct Status {
    state: AtomicU32,
    secthreads: AtomicI32,
}

impl Status {
    pub fn new() -> Arc<Status> {
        Arc::new(Status {
            state: AtomicU32::new(RunState::Running as u32),
            secthreads: AtomicI32::new(0),
        })
    }

    /// Current state, folding in any pending termination signal.
    pub fn get(&self) -> RunState {
        let cur = RunState::from_u32(self.state.load(Ordering::SeqCst));
        if cur != RunState::Running {
            return cur;
        }
        if SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            errmsg_once();
            self.state.store(RunState::Aborted as u32, Ordering::SeqCst);
            return RunState::Aborted;
        }
        RunState::Running
    }

    /// True while no abort/failure/finish has been requested.
    pub fn is_running(&self) -> bool {
        self.get() == RunState::Running
    }

    pub fn set(&self, state: RunState, context: &str) {
        crate::msg!(2, "status := {} ({context})", state.name());
        self.state.store(state as u32, Ordering::SeqCst);
    }

    // census of non-main threads, used for clean shutdown

    pub fn enter_secondary(&self) {
        self.secthreads.fetch_add(1, Ordering::SeqCst);
    }

    pub fn leave_secondary(&self) {
        self.secthreads.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn secondary_count(&self) -> i32 {
        self.secthreads.load(Ordering::SeqCst)
    }
}

fn errmsg_once() {
    static PRINTED: AtomicBool = AtomicBool::new(false);
    if !PRINTED.swap(true, Ordering::SeqCst) {
        eprintln!("termination signal received, aborting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        let st = Status::new();
        assert_eq!(st.get(), RunState::Running);
        st.set(RunState::Failed, "test");
        assert_eq!(st.get(), RunState::Failed);
        assert!(!st.is_running());
    }

    #[test]
    fn census() {
        let st = Status::new();
        st.enter_secondary();
        st.enter_secondary();
        assert_eq!(st.secondary_count(), 2);
        st.leave_secondary();
        assert_eq!(st.secondary_count(), 1);
    }
}
