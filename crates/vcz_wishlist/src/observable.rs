//! Scoped publish/subscribe for engine events.
//!
//! An [`Observable`] owns the callbacks registered for one kind of event.
//! Registering returns a [`Subscription`] which removes the callback when it
//! is dropped, so whoever subscribes decides how long it keeps listening.
use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

/// A callback invoked with the payload of an event.
pub type Observer<T> = Box<dyn Fn(&T)>;

struct Registry<T> {
    next_id: u64,
    observers: Vec<(u64, Rc<dyn Fn(&T)>)>,
}

/// A list of callbacks for one event type.
pub struct Observable<T> {
    registry: Rc<RefCell<Registry<T>>>,
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry {
                next_id: 0,
                observers: Vec::new(),
            })),
        }
    }
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable").field("observers", &self.len()).finish()
    }
}

impl<T: 'static> Observable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`, it will be called on every [`Self::emit`] until
    /// the returned subscription is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn observe(&self, observer: Observer<T>) -> Subscription {
        let mut registry = self.registry.borrow_mut();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.observers.push((id, Rc::from(observer)));

        let weak: Weak<RefCell<Registry<T>>> = Rc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.borrow_mut().observers.retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    /// Call every registered observer with `value`.
    ///
    /// Observers may subscribe or unsubscribe from inside the callback. The
    /// set of observers called is the one registered when `emit` started.
    pub fn emit(&self, value: &T) {
        let observers: Vec<Rc<dyn Fn(&T)>> = self
            .registry
            .borrow()
            .observers
            .iter()
            .map(|(_, o)| o.clone())
            .collect();

        for observer in observers {
            observer(value);
        }
    }
}

impl<T> Observable<T> {
    pub fn len(&self) -> usize {
        self.registry.borrow().observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps an observer registered while alive.
///
/// If the [`Observable`] is dropped first, the subscription does nothing.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
