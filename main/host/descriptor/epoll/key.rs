use crate::host::descriptor::File;

/// An entry in the epoll interest list is keyed on the descriptor's fd and
/// the file it points to, following `epoll_ctl(2)`: the same file under two
/// fds is two distinct entries.
#[derive(Clone)]
pub struct Key {
    fd: i32,
    file: File,
}

impl Key {
    pub fn new(fd: i32, file: File) -> Self {
        Self { fd, file }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }
}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fd.hash(state);
        self.file.canonical_handle().hash(state);
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.fd == other.fd && self.file.canonical_handle() == other.file.canonical_handle()
    }
}

impl Eq for Key {}

/// A [`Key`] with a priority, for the ready set. Priorities count down from
/// `u64::MAX`, so a smaller priority means the entry was made ready more
/// recently.
pub struct PriorityKey {
    pri: u64,
    key: Key,
}

impl PriorityKey {
    pub fn new(pri: u64, key: Key) -> Self {
        Self { pri, key }
    }

    pub fn priority(&self) -> u64 {
        self.pri
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.pri.cmp(&other.pri)
    }
}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PriorityKey {
    fn eq(&self, other: &Self) -> bool {
        self.pri == other.pri
    }
}

impl Eq for PriorityKey {}

impl From<PriorityKey> for Key {
    fn from(val: PriorityKey) -> Self {
        val.key
    }
}
