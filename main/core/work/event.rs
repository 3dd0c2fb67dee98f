use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::HostId;

use super::task::TaskRef;
use crate::host::host::Host;

/// A deferred unit of work bound to a destination host at a point in virtual
/// time. Owned by the destination host's queue until executed, then consumed.
#[derive(Debug)]
pub struct Event {
    task: TaskRef,
    time: EmulatedTime,
    src_host_id: HostId,
    dst_host_id: HostId,
    src_host_event_id: u64,
}

impl Event {
    pub fn new(task: TaskRef, time: EmulatedTime, src_host: &Host, dst_host_id: HostId) -> Self {
        Self {
            task,
            time,
            src_host_id: src_host.id(),
            dst_host_id,
            src_host_event_id: src_host.get_new_event_id(),
        }
    }

    /// Build an event without a `Host` in hand. Used by schedule handles that
    /// mint event ids from the host's shared counter.
    pub(crate) fn from_parts(
        task: TaskRef,
        time: EmulatedTime,
        src_host_id: HostId,
        dst_host_id: HostId,
        src_host_event_id: u64,
    ) -> Self {
        Self {
            task,
            time,
            src_host_id,
            dst_host_id,
            src_host_event_id,
        }
    }

    pub fn execute(self, host: &Host) {
        // make sure we're executing on the correct host
        assert_eq!(self.host_id(), host.id());

        self.task.execute(host);
    }

    pub fn time(&self) -> EmulatedTime {
        self.time
    }

    pub fn host_id(&self) -> HostId {
        self.dst_host_id
    }

    pub fn set_time(&mut self, time: EmulatedTime) {
        self.time = time;
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.task == other.task
            && self.time == other.time
            && self.src_host_id == other.src_host_id
            && self.dst_host_id == other.dst_host_id
            && self.src_host_event_id == other.src_host_event_id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        // sort by event time first, then use other fields we're able to compare
        let cmp = self
            .time
            .cmp(&other.time)
            .then_with(|| self.dst_host_id.cmp(&other.dst_host_id))
            .then_with(|| self.src_host_id.cmp(&other.src_host_id))
            .then_with(|| self.src_host_event_id.cmp(&other.src_host_event_id));

        // if the above fields were all equal (this should ideally not occur in practice since it
        // leads to non-determinism, but we handle it anyways)
        if cmp == std::cmp::Ordering::Equal {
            if self.task != other.task {
                // tasks are not equal, so the events must not be equal
                assert_ne!(self, other);
                // we have nothing left to order them by
                return None;
            }

            // tasks are equal, so the events must be equal
            assert_eq!(self, other);
        }

        Some(cmp)
    }
}
