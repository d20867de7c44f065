/// Runs the wrapped closure exactly once, when the guard goes out of scope.
///
/// Used to release bookkeeping (in-flight markers, running flags) on every exit path of an async
/// block, including cancellation and panics.
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Creates a [`DeferGuard`] for `f`.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}
