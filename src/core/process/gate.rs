//! RAII gate around one in-flight command.
//!
//! Entering the gate moves a process from `Ready` to `Thinking` under the
//! state lock, so at most one command runs per process. Dropping the gate
//! moves it back to `Ready`, or to `Error` if the command faulted or a panic
//! is unwinding through it.

use super::{Pid, ProcessState};
use crate::core::error::CommandError;
use parking_lot::Mutex;

pub(super) struct CommandGate<'a> {
    pid: Pid,
    state: &'a Mutex<ProcessState>,
    exit: ProcessState,
}

impl<'a> CommandGate<'a> {
    pub(super) fn enter(pid: Pid, state: &'a Mutex<ProcessState>) -> Result<Self, CommandError> {
        let mut current = state.lock();
        if !current.accepts_commands() {
            return Err(CommandError::Busy {
                pid,
                state: *current,
            });
        }
        *current = ProcessState::Thinking;

        Ok(Self {
            pid,
            state,
            exit: ProcessState::Ready,
        })
    }

    /// Marks the process unusable once the gate closes.
    pub(super) fn fault(&mut self) {
        self.exit = ProcessState::Error;
    }
}

impl Drop for CommandGate<'_> {
    fn drop(&mut self) {
        let exit = if std::thread::panicking() {
            ProcessState::Error
        } else {
            self.exit
        };
        *self.state.lock() = exit;

        if exit == ProcessState::Error {
            tracing::error!(pid = self.pid, "process moved to ERROR; further commands refused");
        }
    }
}
