use crate::host::descriptor::FileState;
use crate::utility::callback_queue::{CallbackQueue, EventSource, Handle};

#[derive(Clone, Copy, Debug)]
pub enum StateListenerFilter {
    Never,
    OffToOn,
    OnToOff,
    Always,
}

/// [Handles](Handle) for [event source](StateEventSource) listeners.
pub type StateListenHandle = Handle<(FileState, FileState)>;

/// An event source that passes the file's state and the changed bits to the
/// listener, but only if the monitored bits have changed and the change
/// satisfies the filter.
pub struct StateEventSource {
    inner: EventSource<(FileState, FileState)>,
}

impl StateEventSource {
    pub fn new() -> Self {
        Self {
            inner: EventSource::new(),
        }
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        self.inner.add_listener(move |(state, changed), cb_queue| {
            // true if any of the bits we're monitoring have changed
            let flipped = monitoring.intersects(changed);

            // true if any of the bits we're monitoring are set
            let on = monitoring.intersects(state);

            let notify = match filter {
                // at least one monitored bit is on, and at least one has changed
                StateListenerFilter::OffToOn => flipped && on,
                // all monitored bits are off, and at least one has changed
                StateListenerFilter::OnToOff => flipped && !on,
                // at least one monitored bit has changed
                StateListenerFilter::Always => flipped,
                StateListenerFilter::Never => false,
            };

            if !notify {
                return;
            }

            (notify_fn)(state, changed, cb_queue)
        })
    }

    pub fn notify_listeners(
        &mut self,
        state: FileState,
        changed: FileState,
        cb_queue: &mut CallbackQueue,
    ) {
        self.inner.notify_listeners((state, changed), cb_queue)
    }
}

impl Default for StateEventSource {
    fn default() -> Self {
        Self::new()
    }
}
