//! Virtual file descriptors and file descriptions. These objects are the only
//! legal side effects a managed process may produce against the simulated
//! world.

use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

use crate::host::descriptor::listener::{StateListenHandle, StateListenerFilter};
use crate::host::descriptor::socket::{Socket, SocketRef, SocketRefMut};
use crate::host::syscall::types::SyscallError;
use crate::utility::callback_queue::CallbackQueue;
use crate::utility::{IsSend, IsSync};

pub mod descriptor_table;
pub mod epoll;
pub mod eventfd;
pub mod listener;
pub mod pipe;
pub mod shared_buf;
pub mod socket;
pub mod timerfd;

bitflags::bitflags! {
    /// These are flags that can potentially be changed from the managed process (analogous to the
    /// Linux `filp->f_flags` status flags). Not all `O_` flags are valid here. For example file
    /// access mode flags (ex: `O_RDWR`) are stored elsewhere, and file creation flags (ex:
    /// `O_CREAT`) are not stored anywhere. Many of these can be represented in different ways, for
    /// example: `O_NONBLOCK`, `SOCK_NONBLOCK`, `EFD_NONBLOCK`, etc, and not all have the same
    /// value.
    #[derive(Default, Copy, Clone, Debug)]
    pub struct FileStatus: i32 {
        const NONBLOCK = libc::O_NONBLOCK;
    }
}

bitflags::bitflags! {
    /// These are flags that should generally not change (analogous to the Linux `filp->f_mode`).
    /// Since the managed process will never see these values and they're not exposed by the
    /// kernel, we don't match the kernel `FMODE_` values here.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FileMode: u32 {
        const READ = 0b00000001;
        const WRITE = 0b00000010;
    }
}

bitflags::bitflags! {
    /// Flags representing the state of a file. Listeners can subscribe to state changes using
    /// `add_listener` on the file object.
    #[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct FileState: u16 {
        /// Has been initialized and it is now OK to unblock any process waiting on a particular
        /// state.
        const ACTIVE = 1 << 0;
        /// Can be read, i.e. there is data waiting for the user.
        const READABLE = 1 << 1;
        /// Can be written, i.e. there is available buffer space.
        const WRITABLE = 1 << 2;
        /// The user already called close.
        const CLOSED = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Flags of a descriptor, not of its file. In Linux these are not
    /// inherited by `dup`ed descriptors.
    #[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DescriptorFlags: u32 {
        const CLOEXEC = 1 << 0;
    }
}

/// A wrapper for any type of file object.
#[derive(Clone)]
pub enum File {
    Pipe(Arc<AtomicRefCell<pipe::Pipe>>),
    EventFd(Arc<AtomicRefCell<eventfd::EventFd>>),
    TimerFd(Arc<AtomicRefCell<timerfd::TimerFd>>),
    Epoll(Arc<AtomicRefCell<epoll::Epoll>>),
    Socket(Socket),
}

// will not compile if `File` is not Send + Sync
impl IsSend for File {}
impl IsSync for File {}

impl File {
    pub fn borrow(&self) -> FileRef {
        match self {
            Self::Pipe(ref f) => FileRef::Pipe(f.borrow()),
            Self::EventFd(ref f) => FileRef::EventFd(f.borrow()),
            Self::TimerFd(ref f) => FileRef::TimerFd(f.borrow()),
            Self::Epoll(ref f) => FileRef::Epoll(f.borrow()),
            Self::Socket(ref f) => FileRef::Socket(f.borrow()),
        }
    }

    pub fn borrow_mut(&self) -> FileRefMut {
        match self {
            Self::Pipe(ref f) => FileRefMut::Pipe(f.borrow_mut()),
            Self::EventFd(ref f) => FileRefMut::EventFd(f.borrow_mut()),
            Self::TimerFd(ref f) => FileRefMut::TimerFd(f.borrow_mut()),
            Self::Epoll(ref f) => FileRefMut::Epoll(f.borrow_mut()),
            Self::Socket(ref f) => FileRefMut::Socket(f.borrow_mut()),
        }
    }

    /// Two `File` objects refer to the same underlying data if their canonical handles are equal.
    pub fn canonical_handle(&self) -> usize {
        match self {
            Self::Pipe(f) => Arc::as_ptr(f) as usize,
            Self::EventFd(f) => Arc::as_ptr(f) as usize,
            Self::TimerFd(f) => Arc::as_ptr(f) as usize,
            Self::Epoll(f) => Arc::as_ptr(f) as usize,
            Self::Socket(ref f) => f.canonical_handle(),
        }
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe(_) => write!(f, "Pipe")?,
            Self::EventFd(_) => write!(f, "EventFd")?,
            Self::TimerFd(_) => write!(f, "TimerFd")?,
            Self::Epoll(_) => write!(f, "Epoll")?,
            Self::Socket(_) => write!(f, "Socket")?,
        }

        let file = self.borrow();
        let state = file.state();
        let status = file.status();
        write!(f, "(state: {state:?}, status: {status:?})")
    }
}

/// Wraps an immutably borrowed [`File`].
pub enum FileRef<'a> {
    Pipe(atomic_refcell::AtomicRef<'a, pipe::Pipe>),
    EventFd(atomic_refcell::AtomicRef<'a, eventfd::EventFd>),
    TimerFd(atomic_refcell::AtomicRef<'a, timerfd::TimerFd>),
    Epoll(atomic_refcell::AtomicRef<'a, epoll::Epoll>),
    Socket(SocketRef<'a>),
}

/// Wraps a mutably borrowed [`File`].
pub enum FileRefMut<'a> {
    Pipe(atomic_refcell::AtomicRefMut<'a, pipe::Pipe>),
    EventFd(atomic_refcell::AtomicRefMut<'a, eventfd::EventFd>),
    TimerFd(atomic_refcell::AtomicRefMut<'a, timerfd::TimerFd>),
    Epoll(atomic_refcell::AtomicRefMut<'a, epoll::Epoll>),
    Socket(SocketRefMut<'a>),
}

impl FileRef<'_> {
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn has_open_file(&self) -> bool
    );
}

impl FileRefMut<'_> {
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (status), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn set_status(&mut self, status: FileStatus)
    );
    enum_passthrough!(self, (), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn has_open_file(&self) -> bool
    );
    enum_passthrough!(self, (val), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn set_has_open_file(&mut self, val: bool)
    );
    enum_passthrough!(self, (cb_queue), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (monitoring, filter, notify_fn), Pipe, EventFd, TimerFd, Epoll, Socket;
        pub fn add_listener(
            &mut self,
            monitoring: FileState,
            filter: StateListenerFilter,
            notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
        ) -> StateListenHandle
    );
}

impl std::fmt::Debug for FileRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe(_) => write!(f, "Pipe")?,
            Self::EventFd(_) => write!(f, "EventFd")?,
            Self::TimerFd(_) => write!(f, "TimerFd")?,
            Self::Epoll(_) => write!(f, "Epoll")?,
            Self::Socket(_) => write!(f, "Socket")?,
        }

        let state = self.state();
        let status = self.status();
        write!(f, "(state: {state:?}, status: {status:?})")
    }
}

/// Represents a POSIX file description, or a Linux `struct file`. An `OpenFile` wraps a reference
/// to a [`File`]. Once there are no more `OpenFile` objects for a given `File`, the `File` will be
/// closed. Typically this means that holding an `OpenFile` will ensure that the file remains open
/// (the file's state will not become [`FileState::CLOSED`]), but the underlying file may close
/// itself in extenuating circumstances (for example if the file has an internal error).
///
/// **Warning:** If an `OpenFile` for a specific file already exists, it is an error to create a new
/// `OpenFile` for that file. You must clone the existing `OpenFile` object.
#[derive(Clone, Debug)]
pub struct OpenFile {
    inner: Arc<OpenFileInner>,
}

// will not compile if `OpenFile` is not Send + Sync
impl IsSend for OpenFile {}
impl IsSync for OpenFile {}

impl OpenFile {
    pub fn new(file: File) -> Self {
        {
            let mut file = file.borrow_mut();

            if file.state().contains(FileState::CLOSED) {
                // panic if debug assertions are enabled
                debug_panic!("Creating an `OpenFile` object for a closed file");
            }

            if file.has_open_file() {
                // panic if debug assertions are enabled
                debug_panic!(
                    "Creating an `OpenFile` object for a file that already has an `OpenFile` object"
                );
            }

            file.set_has_open_file(true);
        }

        Self {
            inner: Arc::new(OpenFileInner { file: Some(file) }),
        }
    }

    pub fn inner_file(&self) -> &File {
        self.inner.file.as_ref().unwrap()
    }

    /// Will close the inner `File` object if this is the last `OpenFile` for that `File`. This
    /// behaviour is the same as simply dropping this `OpenFile` object, but allows you to pass a
    /// callback queue and get the return value of the close operation.
    pub fn close(self, cb_queue: &mut CallbackQueue) -> Option<Result<(), SyscallError>> {
        // if this is the last reference, call close() on the file
        Arc::into_inner(self.inner).map(|mut inner| inner.close_helper(cb_queue))
    }
}

#[derive(Debug)]
struct OpenFileInner {
    file: Option<File>,
}

impl OpenFileInner {
    fn close_helper(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        if let Some(file) = self.file.take() {
            file.borrow_mut().close(cb_queue)?;
        }
        Ok(())
    }
}

impl std::ops::Drop for OpenFileInner {
    fn drop(&mut self) {
        // ignore any return value
        let _ = CallbackQueue::queue_and_run(|cb_queue| self.close_helper(cb_queue));
    }
}

/// A file descriptor that references an open file. Also contains flags that change the behaviour
/// of this file descriptor.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// The file that this descriptor points to.
    file: OpenFile,
    /// Descriptor flags.
    flags: DescriptorFlags,
}

// will not compile if `Descriptor` is not Send + Sync
impl IsSend for Descriptor {}
impl IsSync for Descriptor {}

impl Descriptor {
    pub fn new(file: OpenFile) -> Self {
        Self {
            file,
            flags: DescriptorFlags::empty(),
        }
    }

    pub fn open_file(&self) -> &OpenFile {
        &self.file
    }

    pub fn file(&self) -> &File {
        self.file.inner_file()
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: DescriptorFlags) {
        self.flags = flags;
    }

    /// Close the descriptor, closing the file if this was the last descriptor for it.
    pub fn close(self, cb_queue: &mut CallbackQueue) -> Option<Result<(), SyscallError>> {
        self.file.close(cb_queue)
    }

    /// Duplicate the descriptor, with both descriptors pointing to the same `OpenFile`. In
    /// Linux, the descriptor flags aren't typically copied to the new descriptor, so we
    /// explicitly require a flags value to avoid confusion.
    pub fn dup(&self, flags: DescriptorFlags) -> Self {
        Self {
            file: self.file.clone(),
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_closes_on_last_drop() {
        let eventfd = Arc::new(AtomicRefCell::new(eventfd::EventFd::new(
            0,
            false,
            FileStatus::empty(),
        )));
        let file = File::EventFd(Arc::clone(&eventfd));

        let open_a = OpenFile::new(file);
        let open_b = open_a.clone();

        // the first close is not the last reference
        assert!(CallbackQueue::queue_and_run(|cb| open_a.close(cb)).is_none());
        assert!(!eventfd.borrow().state().contains(FileState::CLOSED));

        // the second close is
        assert!(CallbackQueue::queue_and_run(|cb| open_b.close(cb)).is_some());
        assert!(eventfd.borrow().state().contains(FileState::CLOSED));
    }

    #[test]
    fn test_dup_shares_file() {
        let eventfd = Arc::new(AtomicRefCell::new(eventfd::EventFd::new(
            0,
            false,
            FileStatus::empty(),
        )));

        let mut desc = Descriptor::new(OpenFile::new(File::EventFd(eventfd)));
        desc.set_flags(DescriptorFlags::CLOEXEC);

        let dup = desc.dup(DescriptorFlags::empty());
        assert_eq!(
            desc.file().canonical_handle(),
            dup.file().canonical_handle()
        );
        assert_eq!(dup.flags(), DescriptorFlags::empty());
        assert_eq!(desc.flags(), DescriptorFlags::CLOEXEC);
    }
}
