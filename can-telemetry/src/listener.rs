//! Listener fan-out
//!
//! Every frame that enters the library (from a transport reader or from the
//! replay scheduler) is pushed through a [`ListenerRegistry`], which hands it to
//! each registered listener in registration order.
//!
//! One lock guards the whole listener list. `add`, `remove` and `notify` are
//! mutually exclusive, so a listener that blocks stalls every producer and a
//! listener that calls back into the same registry deadlocks. Listeners are
//! expected to return quickly (append to a store, push onto a channel).
//!
//! A panicking listener is isolated: the panic is caught, logged, counted, and
//! the remaining listeners still receive the frame.

use crate::types::{Frame, TelemetryError};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A consumer of bus frames
pub trait Listener: Send + Sync {
    /// Called once per frame, on the producer's thread
    fn on_frame(&self, frame: &Frame);

    /// Name used in log output
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> Listener for F
where
    F: Fn(&Frame) + Send + Sync,
{
    fn on_frame(&self, frame: &Frame) {
        self(frame)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// Opaque, cloneable capability wrapping one listener
///
/// Handles compare by identity: a clone of a handle refers to the same
/// listener, while two handles built from equal closures do not.
#[derive(Clone)]
pub struct ListenerHandle {
    inner: Arc<dyn Listener>,
}

impl ListenerHandle {
    /// Wrap a listener
    pub fn new<L: Listener + 'static>(listener: L) -> Self {
        Self {
            inner: Arc::new(listener),
        }
    }

    /// Wrap an already shared listener (e.g. a store also queried elsewhere)
    pub fn from_arc<L: Listener + 'static>(listener: Arc<L>) -> Self {
        Self { inner: listener }
    }

    /// Wrap a closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        Self::new(f)
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    fn call(&self, frame: &Frame) {
        self.inner.on_frame(frame)
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ListenerHandle {}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("name", &self.name())
            .finish()
    }
}

/// Thread-safe fan-out of frames to registered listeners
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<ListenerHandle>>,
    delivered: AtomicU64,
    faults: AtomicU64,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it receives every frame notified after this call
    pub fn add(&self, listener: ListenerHandle) {
        log::debug!("Adding listener {}", listener.name());
        self.listeners.lock().push(listener);
    }

    /// Unregister a listener
    ///
    /// Returns `false` (and logs) if the listener was not registered.
    pub fn remove(&self, listener: &ListenerHandle) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.iter().position(|l| l == listener) {
            Some(index) => {
                listeners.remove(index);
                log::debug!("Removed listener {}", listener.name());
                true
            }
            None => {
                log::warn!("Listener {} not found", listener.name());
                false
            }
        }
    }

    /// Deliver `frame` to every listener, sequentially, in registration order
    ///
    /// Returns the faults raised by listeners during this call; a faulting
    /// listener does not prevent delivery to the ones after it.
    pub fn notify(&self, frame: &Frame) -> Vec<TelemetryError> {
        let listeners = self.listeners.lock();
        let mut faults = Vec::new();

        for listener in listeners.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.call(frame)));
            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                log::error!(
                    "Listener {} panicked on frame 0x{:X}: {}",
                    listener.name(),
                    frame.arbitration_id,
                    message
                );
                self.faults.fetch_add(1, Ordering::Relaxed);
                faults.push(TelemetryError::ListenerFault {
                    listener: listener.name().to_string(),
                    message,
                });
            }
        }

        self.delivered.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "Notified {} listeners of frame 0x{:X}",
            listeners.len(),
            frame.arbitration_id
        );
        faults
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames notified since creation
    pub fn frames_notified(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Listener faults caught since creation
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (ListenerHandle, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = ListenerHandle::from_fn(move |frame: &Frame| {
            sink.lock().push(frame.arbitration_id);
        });
        (handle, seen)
    }

    #[test]
    fn test_notify_in_registration_order() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.add(ListenerHandle::from_fn(move |_: &Frame| {
                order.lock().push(tag);
            }));
        }

        let faults = registry.notify(&Frame::new(0x100, &[1]));
        assert!(faults.is_empty());
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
        assert_eq!(registry.frames_notified(), 1);
    }

    #[test]
    fn test_remove_listener() {
        let registry = ListenerRegistry::new();
        let (handle, seen) = recorder();
        registry.add(handle.clone());

        registry.notify(&Frame::new(0x1, &[]));
        assert!(registry.remove(&handle));
        registry.notify(&Frame::new(0x2, &[]));

        assert_eq!(*seen.lock(), vec![0x1]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_unknown_listener_is_not_fatal() {
        let registry = ListenerRegistry::new();
        let (registered, _) = recorder();
        let (stranger, _) = recorder();
        registry.add(registered);

        assert!(!registry.remove(&stranger));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handles_compare_by_identity() {
        let (a, _) = recorder();
        let (b, _) = recorder();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = ListenerRegistry::new();
        registry.add(ListenerHandle::from_fn(|_: &Frame| panic!("boom")));
        let (handle, seen) = recorder();
        registry.add(handle);

        let faults = registry.notify(&Frame::new(0x42, &[]));

        assert_eq!(faults.len(), 1);
        assert!(matches!(
            &faults[0],
            TelemetryError::ListenerFault { message, .. } if message == "boom"
        ));
        assert_eq!(*seen.lock(), vec![0x42]);
        assert_eq!(registry.fault_count(), 1);
    }

    #[test]
    fn test_concurrent_notify_and_add() {
        let registry = Arc::new(ListenerRegistry::new());
        let (handle, seen) = recorder();
        registry.add(handle);

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        registry.notify(&Frame::new(t * 100 + i, &[]));
                    }
                })
            })
            .collect();
        for _ in 0..10 {
            registry.add(ListenerHandle::from_fn(|_: &Frame| {}));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(seen.lock().len(), 200);
        assert_eq!(registry.len(), 11);
    }
}
