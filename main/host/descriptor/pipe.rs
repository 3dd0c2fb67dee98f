use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::shared_buf::{
    BufferHandle, BufferState, ReaderHandle, SharedBuf, WriterHandle,
};
use crate::host::descriptor::{FileMode, FileState, FileStatus};
use crate::host::syscall::types::SyscallError;
use crate::utility::callback_queue::CallbackQueue;

/// The buffer size of a newly created pipe, following Linux's default.
pub const PIPE_CAPACITY: usize = 65536;

/// One end of an emulated pipe. The two ends share a [`SharedBuf`].
pub struct Pipe {
    buffer: Option<Arc<AtomicRefCell<SharedBuf>>>,
    event_source: StateEventSource,
    state: FileState,
    mode: FileMode,
    status: FileStatus,
    // we only store these so that the handles are dropped when we are
    buffer_event_handle: Option<BufferHandle>,
    reader_handle: Option<ReaderHandle>,
    writer_handle: Option<WriterHandle>,
    // should only be used by `OpenFile` to make sure there is only ever one `OpenFile` instance
    // for this file
    has_open_file: bool,
}

impl Pipe {
    /// Create a new [`Pipe`]. The new pipe must be initialized using
    /// [`Pipe::connect_to_buffer`] before any of its methods are called.
    pub fn new(mode: FileMode, status: FileStatus) -> Self {
        Self {
            buffer: None,
            event_source: StateEventSource::new(),
            state: FileState::ACTIVE,
            mode,
            status,
            buffer_event_handle: None,
            reader_handle: None,
            writer_handle: None,
            has_open_file: false,
        }
    }

    /// Create a connected (read, write) pair of pipe ends.
    pub fn new_pair(status: FileStatus) -> (Arc<AtomicRefCell<Pipe>>, Arc<AtomicRefCell<Pipe>>) {
        let buffer = Arc::new(AtomicRefCell::new(SharedBuf::new(PIPE_CAPACITY)));

        let reader = Arc::new(AtomicRefCell::new(Pipe::new(FileMode::READ, status)));
        let writer = Arc::new(AtomicRefCell::new(Pipe::new(FileMode::WRITE, status)));

        CallbackQueue::queue_and_run(|cb_queue| {
            Pipe::connect_to_buffer(&reader, Arc::clone(&buffer), cb_queue);
            Pipe::connect_to_buffer(&writer, buffer, cb_queue);
        });

        (reader, writer)
    }

    pub fn connect_to_buffer(
        arc: &Arc<AtomicRefCell<Self>>,
        buffer: Arc<AtomicRefCell<SharedBuf>>,
        cb_queue: &mut CallbackQueue,
    ) {
        let weak = Arc::downgrade(arc);
        let pipe = &mut *arc.borrow_mut();

        pipe.buffer = Some(buffer);

        if pipe.mode.contains(FileMode::READ) {
            pipe.reader_handle = Some(
                pipe.buffer
                    .as_ref()
                    .unwrap()
                    .borrow_mut()
                    .add_reader(cb_queue),
            );
        }
        if pipe.mode.contains(FileMode::WRITE) {
            pipe.writer_handle = Some(
                pipe.buffer
                    .as_ref()
                    .unwrap()
                    .borrow_mut()
                    .add_writer(cb_queue),
            );
        }

        // the buffer state bits that are relevant to this end
        let mut monitoring = BufferState::empty();
        if pipe.mode.contains(FileMode::READ) {
            monitoring |= BufferState::READABLE | BufferState::NO_WRITERS;
        }
        if pipe.mode.contains(FileMode::WRITE) {
            monitoring |= BufferState::WRITABLE | BufferState::NO_READERS;
        }

        let handle = pipe.buffer.as_ref().unwrap().borrow_mut().add_listener(
            monitoring,
            move |buffer_state, cb_queue| {
                // if the file hasn't been dropped
                if let Some(pipe) = weak.upgrade() {
                    let mut pipe = pipe.borrow_mut();

                    // if the pipe is already closed, do nothing
                    if pipe.state.contains(FileState::CLOSED) {
                        return;
                    }

                    pipe.refresh_state(buffer_state, cb_queue);
                }
            },
        );

        pipe.buffer_event_handle = Some(handle);

        // update the pipe file's initial state based on the buffer's state
        let buffer_state = pipe.buffer.as_ref().unwrap().borrow().state();
        pipe.refresh_state(buffer_state, cb_queue);
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn has_open_file(&self) -> bool {
        self.has_open_file
    }

    pub fn set_has_open_file(&mut self, val: bool) {
        self.has_open_file = val;
    }

    pub fn max_size(&self) -> usize {
        self.buffer.as_ref().unwrap().borrow().max_len()
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        // drop the event listener handle so that we stop receiving new events
        self.buffer_event_handle.take().unwrap().stop_listening();

        // inform the buffer that there is one fewer readers/writers
        if let Some(handle) = self.reader_handle.take() {
            self.buffer
                .as_ref()
                .unwrap()
                .borrow_mut()
                .remove_reader(handle, cb_queue);
        }
        if let Some(handle) = self.writer_handle.take() {
            self.buffer
                .as_ref()
                .unwrap()
                .borrow_mut()
                .remove_writer(handle, cb_queue);
        }

        // no need to hold on to the buffer anymore
        self.buffer = None;

        // set the closed flag and remove the active, readable, and writable flags
        self.copy_state(
            FileState::CLOSED | FileState::ACTIVE | FileState::READABLE | FileState::WRITABLE,
            FileState::CLOSED,
            cb_queue,
        );

        Ok(())
    }

    pub fn read(
        &mut self,
        dst: &mut [u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // if the file is not open for reading, return EBADF
        if !self.mode.contains(FileMode::READ) {
            return Err(Errno::EBADF.into());
        }

        let max = dst.len();
        let buffer = self.buffer.as_ref().unwrap();
        let num_writers = buffer.borrow().num_writers();
        let num_read = buffer.borrow_mut().read(dst, max, cb_queue)?;

        // the read would block if we could not read any bytes, we were asked to read >0 bytes,
        // and there are open descriptors that refer to the write end of the pipe
        if num_read == 0 && max > 0 && num_writers > 0 {
            return Err(Errno::EWOULDBLOCK.into());
        }

        Ok(num_read)
    }

    pub fn write(
        &mut self,
        src: &[u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // if the file is not open for writing, return EBADF
        if !self.mode.contains(FileMode::WRITE) {
            return Err(Errno::EBADF.into());
        }

        let buffer = self.buffer.as_ref().unwrap();

        // pipe(7): a write with no readers raises EPIPE
        if buffer.borrow().num_readers() == 0 {
            return Err(Errno::EPIPE.into());
        }

        let num_written = buffer
            .borrow_mut()
            .write_stream(src, src.len(), cb_queue)?;

        Ok(num_written)
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        self.event_source.add_listener(monitoring, filter, notify_fn)
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    fn refresh_state(&mut self, buffer_state: BufferState, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        let mut new_state = FileState::empty();

        if self.mode.contains(FileMode::READ) {
            // a read end with data, or with no writers left (EOF), is readable
            new_state.set(
                FileState::READABLE,
                buffer_state.intersects(BufferState::READABLE | BufferState::NO_WRITERS),
            );
        }
        if self.mode.contains(FileMode::WRITE) {
            // a write end with space, or with no readers left (EPIPE), is writable
            new_state.set(
                FileState::WRITABLE,
                buffer_state.intersects(BufferState::WRITABLE | BufferState::NO_READERS),
            );
        }

        self.copy_state(FileState::READABLE | FileState::WRITABLE, new_state, cb_queue);
    }

    fn copy_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        // remove the masked flags, then copy the masked flags
        self.state.remove(mask);
        self.state.insert(state & mask);

        self.handle_state_change(old_state, cb_queue);
    }

    fn handle_state_change(&mut self, old_state: FileState, cb_queue: &mut CallbackQueue) {
        let states_changed = self.state ^ old_state;

        // if nothing changed
        if states_changed.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners(self.state, states_changed, cb_queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let (reader, writer) = Pipe::new_pair(FileStatus::empty());

        CallbackQueue::queue_and_run(|cb_queue| {
            assert_eq!(writer.borrow_mut().write(b"ping", cb_queue).unwrap(), 4);
        });
        assert!(reader.borrow().state().contains(FileState::READABLE));

        CallbackQueue::queue_and_run(|cb_queue| {
            let mut buf = [0u8; 16];
            assert_eq!(reader.borrow_mut().read(&mut buf, cb_queue).unwrap(), 4);
            assert_eq!(&buf[..4], b"ping");
        });
        assert!(!reader.borrow().state().contains(FileState::READABLE));
    }

    #[test]
    fn test_read_empty_would_block() {
        let (reader, _writer) = Pipe::new_pair(FileStatus::empty());

        CallbackQueue::queue_and_run(|cb_queue| {
            let mut buf = [0u8; 16];
            assert!(matches!(
                reader.borrow_mut().read(&mut buf, cb_queue),
                Err(SyscallError::Failed(ref f)) if f.errno == Errno::EWOULDBLOCK
            ));
        });
    }

    #[test]
    fn test_eof_after_writer_closes() {
        let (reader, writer) = Pipe::new_pair(FileStatus::empty());

        CallbackQueue::queue_and_run(|cb_queue| {
            writer.borrow_mut().close(cb_queue).unwrap();
        });

        // EOF makes the read end readable, and reads return 0
        assert!(reader.borrow().state().contains(FileState::READABLE));
        CallbackQueue::queue_and_run(|cb_queue| {
            let mut buf = [0u8; 16];
            assert_eq!(reader.borrow_mut().read(&mut buf, cb_queue).unwrap(), 0);
        });
    }

    #[test]
    fn test_epipe_after_reader_closes() {
        let (reader, writer) = Pipe::new_pair(FileStatus::empty());

        CallbackQueue::queue_and_run(|cb_queue| {
            reader.borrow_mut().close(cb_queue).unwrap();
        });

        CallbackQueue::queue_and_run(|cb_queue| {
            assert!(matches!(
                writer.borrow_mut().write(b"x", cb_queue),
                Err(SyscallError::Failed(ref f)) if f.errno == Errno::EPIPE
            ));
        });
    }
}
