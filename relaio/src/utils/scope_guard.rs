/// Runs a closure when it goes out of scope.
///
/// Critical sections and batch mode both have to be unwound on every exit
/// path, including a panic raised from inside a completion callback.
///
/// ```ignore
/// core.enter_crit_section();
/// let _crit = ScopeGuard::new(|| core.exit_crit_section());
/// // completion callbacks run here
/// ```
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken on drop so the closure runs at most once.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_runs_on_drop_and_unwind() {
        let depth = Cell::new(1);
        {
            let _guard = ScopeGuard::new(|| depth.set(depth.get() - 1));
            assert_eq!(depth.get(), 1);
        }
        assert_eq!(depth.get(), 0);

        let flag = std::sync::atomic::AtomicBool::new(false);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = ScopeGuard::new(|| flag.store(true, std::sync::atomic::Ordering::SeqCst));
            panic!("callback failed");
        }));
        assert!(res.is_err());
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
