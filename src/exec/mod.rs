//! Per-request execution context.
//!
//! One [`Execution`] exists for each request and lives as long as the
//! handler's processing of it. Cleanup work that must run when the handler
//! is finished, whatever the outcome, is registered through
//! [`Execution::on_complete`]; the connection driver calls
//! [`Execution::complete`] exactly once after the response is written.
//!
//! The body intake layer uses this to release a composed body buffer that
//! the handler received but never explicitly released.

use std::cell::{Cell, RefCell};

type Hook = Box<dyn FnOnce()>;

/// Cooperative per-request completion scope.
#[derive(Default)]
pub struct Execution {
    hooks: RefCell<Vec<Hook>>,
    completed: Cell<bool>,
}

impl Execution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `hook` to run when the execution completes. Hooks run in
    /// registration order. If the execution has already completed, `hook`
    /// runs immediately.
    pub fn on_complete(&self, hook: impl FnOnce() + 'static) {
        if self.completed.get() {
            hook();
        } else {
            self.hooks.borrow_mut().push(Box::new(hook));
        }
    }

    /// Runs all registered hooks. Later calls are no-ops.
    pub fn complete(&self) {
        if self.completed.replace(true) {
            return;
        }
        // hooks registered from here on run immediately, so the vec cannot
        // refill while draining
        let drained: Vec<Hook> = self.hooks.borrow_mut().drain(..).collect();
        for hook in drained {
            hook();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.get()
    }
}
