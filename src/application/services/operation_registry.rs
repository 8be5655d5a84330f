//! Per-key tracking of cancellable image loads.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::infrastructure::imaging::{DownloadHandle, RequestHandle};

/// Anything that can be told to stop delivering results.
pub trait Cancellable: Send {
    /// Stops delivery to this caller. Calling it again has no effect.
    fn cancel(&self);
}

impl Cancellable for RequestHandle {
    fn cancel(&self) {
        RequestHandle::cancel(self);
    }
}

impl Cancellable for DownloadHandle {
    fn cancel(&self) {
        DownloadHandle::cancel(self);
    }
}

/// Associates in-flight operations with the UI element they load into.
///
/// Reusing an element for a new image must cancel the old load first, so associating a
/// new handle cancels the previous one under the same key.
pub struct OperationRegistry<K> {
    operations: Mutex<HashMap<K, Box<dyn Cancellable>>>,
}

impl<K: Eq + Hash> OperationRegistry<K> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Tracks `handle` for `key`, cancelling whatever was tracked before.
    pub fn associate(&self, key: K, handle: impl Cancellable + 'static) {
        let previous = self.operations.lock().insert(key, Box::new(handle));
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancels and forgets the operation for `key`.
    pub fn cancel(&self, key: &K) {
        let removed = self.operations.lock().remove(key);
        if let Some(handle) = removed {
            handle.cancel();
        }
    }

    /// Forgets the operation for `key` without cancelling it, typically once it finished.
    pub fn clear(&self, key: &K) {
        self.operations.lock().remove(key);
    }

    /// Cancels every tracked operation.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.operations.lock().drain().map(|(_, h)| h).collect();
        for handle in drained {
            handle.cancel();
        }
    }

    /// Returns true if an operation is tracked for `key`.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.operations.lock().contains_key(key)
    }

    /// Number of tracked operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash> Default for OperationRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for OperationRegistry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("len", &self.operations.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe(Arc<AtomicUsize>);

    impl Cancellable for Probe {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_associate_cancels_previous_for_same_key() {
        let registry = OperationRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry.associate("avatar", Probe(first.clone()));
        registry.associate("avatar", Probe(second.clone()));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_and_clear() {
        let registry = OperationRegistry::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let kept = Arc::new(AtomicUsize::new(0));

        registry.associate(1, Probe(cancelled.clone()));
        registry.associate(2, Probe(kept.clone()));

        registry.cancel(&1);
        registry.clear(&2);
        registry.cancel(&2);

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(kept.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let registry = OperationRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c"] {
            registry.associate(key, Probe(counter.clone()));
        }

        registry.cancel_all();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!registry.contains(&"a"));
    }

    #[tokio::test]
    async fn test_reassociating_request_handle_stops_old_delivery() {
        use crate::domain::entities::WebImageOptions;
        use crate::infrastructure::imaging::test_support::TestServer;
        use crate::infrastructure::imaging::{
            Downloader, DownloaderConfig, ImageCache, ImageCacheConfig, ImageManager,
            ImageResponse, StandardCodec,
        };

        let server = TestServer::start().await;
        let temp_dir = tempfile::TempDir::new().unwrap();
        let cache = ImageCache::new(
            temp_dir.path().to_path_buf(),
            &ImageCacheConfig::default(),
            Arc::new(StandardCodec),
        )
        .unwrap();
        let manager = ImageManager::new(
            Arc::new(cache),
            Downloader::new(DownloaderConfig::default(), Arc::new(StandardCodec)),
        );
        let registry = OperationRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for path in ["/slow/old.png", "/slow/new.png"] {
            let tx = tx.clone();
            let handle = manager.request(
                server.url(path),
                WebImageOptions::empty(),
                None,
                Arc::new(move |response: ImageResponse| {
                    let _ = tx.send(response.url.path().to_string());
                }),
            );
            registry.associate("cell-0", handle);
        }
        drop(tx);

        assert_eq!(rx.recv().await.as_deref(), Some("/slow/new.png"));
    }
}
