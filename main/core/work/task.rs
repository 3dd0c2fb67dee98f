use std::sync::Arc;

use crate::host::host::Host;

/// A unit of work bound to a host. Tasks are one-shot from the event queue's
/// perspective, but the same `TaskRef` may be cloned into several events
/// (repeating timers do this).
#[derive(Clone)]
pub struct TaskRef {
    inner: Arc<dyn Fn(&Host) + Send + Sync>,
}

impl TaskRef {
    pub fn new<F: Fn(&Host) + Send + Sync + 'static>(f: F) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn execute(&self, host: &Host) {
        (self.inner)(host)
    }
}

impl PartialEq for TaskRef {
    /// Two `TaskRef`s are equal if they point to the same task object.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TaskRef {}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRef")
            .field("inner", &Arc::as_ptr(&self.inner))
            .finish()
    }
}
