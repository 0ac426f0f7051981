use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cooperative cancellation handle.
///
/// Cloned into every long-running scan; checked between records, never mid
/// record, so cancellation is never observable as a partial result. Signal
/// once, observed by every clone.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_signalled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::Shutdown;

    #[test]
    fn clones_observe_signal() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        assert!(!other.is_signalled());
        shutdown.signal();
        assert!(other.is_signalled());
    }
}
