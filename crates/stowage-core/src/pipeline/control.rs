use std::sync::{Condvar, Mutex};

use stowage_types::error::{Result, StowageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
    Stopping,
    Terminated,
}

/// Cooperative pause/stop/terminate gate, observed between blocks.
///
/// `progress` returns immediately while running, blocks while paused, and
/// fails with [`StowageError::Terminated`] once terminated. A stop request
/// is recorded but deliberately ignored by `progress`: the pipeline must
/// keep consuming so upstream can drain; stop is honoured at pipeline
/// boundaries instead.
#[derive(Debug)]
pub struct TaskControl {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl TaskControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Running),
            changed: Condvar::new(),
        }
    }

    /// Block until running (or stopping), or fail once terminated.
    pub fn progress(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        loop {
            match *st {
                RunState::Terminated => return Err(StowageError::Terminated),
                RunState::Paused => st = self.changed.wait(st).unwrap(),
                RunState::Running | RunState::Stopping => return Ok(()),
            }
        }
    }

    pub fn pause(&self) {
        self.transition(|st| {
            if *st == RunState::Running {
                *st = RunState::Paused;
            }
        });
    }

    pub fn resume(&self) {
        self.transition(|st| {
            if *st == RunState::Paused {
                *st = RunState::Running;
            }
        });
    }

    /// Request a stop after the in-flight work drains.
    pub fn stop(&self) {
        self.transition(|st| {
            if *st != RunState::Terminated {
                *st = RunState::Stopping;
            }
        });
    }

    /// Abort: sticky, wakes paused waiters, overrides every other state.
    pub fn terminate(&self) {
        self.transition(|st| *st = RunState::Terminated);
    }

    pub fn is_stopping(&self) -> bool {
        *self.state.lock().unwrap() == RunState::Stopping
    }

    pub fn is_terminated(&self) -> bool {
        *self.state.lock().unwrap() == RunState::Terminated
    }

    fn transition(&self, apply: impl FnOnce(&mut RunState)) {
        let mut st = self.state.lock().unwrap();
        apply(&mut st);
        self.changed.notify_all();
    }
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}
