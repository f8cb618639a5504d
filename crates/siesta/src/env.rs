//! The execution environment supplied by the host.
//!
//! Scripts are single-threaded and cooperative: the runtime never blocks a
//! compute thread. Timers and blocking work are delegated to the
//! environment, which posts completions back onto the script's original
//! thread context. `DefaultEnv` services everything inline on the calling
//! thread, which is what synchronous evaluation and tests use.

use std::rc::Rc;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Opaque token identifying the thread context a script started on.
/// Completions scheduled with it run on that context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadContext {
    id: u64,
}

impl ThreadContext {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self { id }
    }
}

/// Host-provided scheduler.
pub trait RuntimeEnv {
    /// Runs `task` on the given thread context as soon as possible.
    fn schedule_event(&self, ctx: &ThreadContext, task: Task);

    /// Runs `task` on the given thread context after `delay_ms`.
    fn schedule_event_delayed(&self, ctx: &ThreadContext, task: Task, delay_ms: i64);

    /// Runs `task` after `delay_ms` on any context.
    fn schedule_delayed(&self, task: Task, delay_ms: i64);

    /// Runs blocking work off the compute threads.
    fn schedule_blocking(&self, task: Task);

    /// The context of the calling thread.
    fn thread_context(&self) -> ThreadContext;
}

/// Inline environment: every task runs immediately on the calling thread,
/// delays via a real sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEnv;

impl DefaultEnv {
    #[must_use]
    pub fn rc() -> Rc<dyn RuntimeEnv> {
        Rc::new(Self)
    }
}

impl RuntimeEnv for DefaultEnv {
    fn schedule_event(&self, _ctx: &ThreadContext, task: Task) {
        task();
    }

    fn schedule_event_delayed(&self, _ctx: &ThreadContext, task: Task, delay_ms: i64) {
        self.schedule_delayed(task, delay_ms);
    }

    fn schedule_delayed(&self, task: Task, delay_ms: i64) {
        if delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay_ms.unsigned_abs()));
        }
        task();
    }

    fn schedule_blocking(&self, task: Task) {
        task();
    }

    fn thread_context(&self) -> ThreadContext {
        ThreadContext::new(0)
    }
}
