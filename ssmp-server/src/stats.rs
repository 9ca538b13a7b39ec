use std::sync::atomic::{AtomicUsize, Ordering};

/// Cumulative server counters, shared between the accept loop and every
/// connection.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total bytes written to clients.
    bytes_tx: AtomicUsize,
    /// Total bytes of dispatched requests.
    bytes_rx: AtomicUsize,
    /// Connections accepted over the server lifetime.
    accepted: AtomicUsize,
}

impl ServerStats {
    #[inline]
    pub fn bytes_tx(&self) -> usize {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_rx(&self) -> usize {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn add_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }
}
