// Context switching for MLQOS
//
// Every kernel thread and every CPU scheduler runs on its own host thread.
// A `Context` is the resume token of one of them: swtch() hands the token
// to the next thread and parks the caller on its own token until someone
// switches back to it.
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::kernel::{unwind, Unwind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Parked,
    Resume,
    Halt,
}

/// Saved execution state of a kernel thread, opaque to the rest of the kernel
pub struct Context {
    token: Mutex<Token>,
    wake: Condvar,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            token: Mutex::new(Token::Parked),
            wake: Condvar::new(),
        }
    }

    fn token(&self) -> MutexGuard<'_, Token> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let the owner of this context continue
    pub(crate) fn resume(&self) {
        let mut token = self.token();
        if *token != Token::Halt {
            *token = Token::Resume;
        }
        self.wake.notify_one();
    }

    /// Wake the owner for good; it unwinds instead of running
    pub(crate) fn halt(&self) {
        *self.token() = Token::Halt;
        self.wake.notify_all();
    }

    /// Block until resumed. Returns false if the machine halted instead.
    pub(crate) fn park(&self) -> bool {
        let mut token = self.token();
        loop {
            match *token {
                Token::Resume => {
                    *token = Token::Parked;
                    return true;
                }
                Token::Halt => return false,
                Token::Parked => {
                    token = self.wake.wait(token).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Forget a stale resume before the slot is reused
    pub(crate) fn reset(&self) {
        let mut token = self.token();
        if *token == Token::Resume {
            *token = Token::Parked;
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Save the caller in `old` and continue `new`.
/// Returns when some other thread switches back to `old`.
pub(crate) fn swtch(old: &Context, new: &Context) {
    new.resume();
    if !old.park() {
        unwind(Unwind::Halted);
    }
}
