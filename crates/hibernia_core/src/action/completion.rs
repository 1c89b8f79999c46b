//! Continuations run when the transaction completes.

use hibernia_cache::CacheResult;
use std::fmt;
use tracing::warn;

/// A continuation receiving whether the transaction committed.
pub type Completion = Box<dyn FnOnce(bool) -> CacheResult<()> + Send>;

/// Work deferred until the transaction outcome is known.
///
/// Second-level cache writes and soft-lock releases are registered here
/// during flush and run exactly once by
/// [`Session::after_transaction_completion`](crate::Session::after_transaction_completion).
#[derive(Default)]
pub struct AfterCompletionQueue {
    pending: Vec<(String, Completion)>,
}

impl AfterCompletionQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a continuation. `description` names it in logs.
    pub fn register(&mut self, description: impl Into<String>, completion: Completion) {
        self.pending.push((description.into(), completion));
    }

    /// Returns the number of registered continuations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Runs every continuation in registration order and empties the queue.
    ///
    /// A failing continuation is logged and does not stop the others.
    /// Returns the number of failures.
    pub fn run(&mut self, successful: bool) -> usize {
        let mut failures = 0;
        for (description, completion) in self.pending.drain(..) {
            if let Err(e) = completion(successful) {
                failures += 1;
                warn!(%description, error = %e, successful, "after-completion action failed");
            }
        }
        failures
    }
}

impl fmt::Debug for AfterCompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfterCompletionQueue")
            .field(
                "pending",
                &self.pending.iter().map(|(d, _)| d.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hibernia_cache::CacheError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn continuations_run_once_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = AfterCompletionQueue::new();
        for i in 0..3 {
            let log = Arc::clone(&log);
            queue.register(
                format!("step {i}"),
                Box::new(move |ok| {
                    log.lock().push((i, ok));
                    Ok(())
                }),
            );
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.run(true), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.run(false), 0);
        assert_eq!(*log.lock(), vec![(0, true), (1, true), (2, true)]);
    }

    #[test]
    fn failures_do_not_stop_the_rest() {
        let ran = Arc::new(Mutex::new(0));
        let mut queue = AfterCompletionQueue::new();
        queue.register(
            "broken",
            Box::new(|_| Err(CacheError::Consistency("boom".into()))),
        );
        let counter = Arc::clone(&ran);
        queue.register(
            "count",
            Box::new(move |_| {
                *counter.lock() += 1;
                Ok(())
            }),
        );
        assert_eq!(queue.run(false), 1);
        assert_eq!(*ran.lock(), 1);
    }
}
