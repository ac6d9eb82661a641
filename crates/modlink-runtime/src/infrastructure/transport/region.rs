//! Shared regions: slot arenas that carry fan-out payloads for native
//! channels.
//!
//! # How a staged event travels (for beginners)
//!
//! A native-channel pulse is tiny: it only names a message number and a
//! slot.  The payload itself is written once into a slot of a shared region,
//! and every subscriber reads it from there.
//!
//! ```text
//!  publisher                       region "xfer-a-3"             subscribers
//!  ─────────                       ─────────────────             ───────────
//!  stage(frame, readers = 2) ───►  slot 4  [frame] readers=2
//!  pulse(msg, slot 4) ──────────────────────────────────────►   A reads slot 4
//!  pulse(msg, slot 4) ──────────────────────────────────────►   B reads slot 4
//!                                  release → readers=1          A done
//!                                  release → readers=0 → free   B done
//! ```
//!
//! A slot is free again only after every reader released it.  When no slot
//! is free, [`SharedRegion::stage`] polls until the slot timeout and then
//! fails with [`TransportError::AllocationFailure`].
//!
//! # Where the bytes live
//!
//! A region is a file under `/dev/shm` (the temp directory where that does
//! not exist) mapped `MAP_SHARED` by every process that opens its name, so
//! the publisher and its subscribers see the same slots.  Reader counts are
//! atomics inside the mapping:
//!
//! ```text
//!  word 0..4        magic | slot count | slot size | creator pid
//!  word 4 + 2i      readers of slot i   (0 = free)
//!  word 5 + 2i      frame length of slot i
//!  data (8-aligned) slot 0 bytes | slot 1 bytes | ...
//! ```
//!
//! The first process to open a name creates and sizes the file; later
//! openers adopt its geometry.  A file whose creator is gone is replaced.
//! The creator unlinks the file when its last handle drops.
//!
//! Within one process, a registry of weak references makes every `open` of a
//! name share one mapping.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use modlink_core::{CodecError, MessageBuffer};
use tracing::{debug, warn};

use super::TransportError;

const MAGIC: u32 = 0x4D4C_5247;
const HEADER_WORDS: usize = 4;
const SLOT_WORDS: usize = 2;
const STAGE_POLL: Duration = Duration::from_millis(1);
/// How long an opener waits for a creator that is still writing the header.
const INIT_WAIT: Duration = Duration::from_secs(1);
const OPEN_ATTEMPTS: usize = 3;

/// Index of one slot inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(pub u32);

/// Returns `(data offset, file length)` for a region of this geometry.
fn layout(slots: usize, slot_size: usize) -> (usize, usize) {
    let data = ((HEADER_WORDS + SLOT_WORDS * slots) * 4).next_multiple_of(8);
    (data, data + slots * slot_size)
}

/// File backing the region called `name`.
pub fn region_path(name: &str) -> PathBuf {
    let shm = Path::new("/dev/shm");
    let dir = if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    };
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("modlink-region-{safe}"))
}

// ── Mapping ───────────────────────────────────────────────────────────────────

/// A read/write `MAP_SHARED` view of a whole region file.
#[derive(Debug)]
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is only accessed through atomics and through slots
// that a reader count reserves for one writer at a time.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn word(&self, index: usize) -> &AtomicU32 {
        debug_assert!((index + 1) * 4 <= self.len);
        // SAFETY: the mapping is page aligned, lives as long as `self`, and
        // callers only pass indexes inside the header and slot table.
        unsafe { &*self.ptr.add(index * 4).cast::<AtomicU32>() }
    }
}

#[cfg(unix)]
mod os {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    use super::Mapping;

    pub(super) fn map(file: &File, len: usize) -> io::Result<Mapping> {
        // SAFETY: the descriptor is valid for the call, and a shared mapping
        // stays valid after the file is closed.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mapping {
            ptr: ptr.cast(),
            len,
        })
    }

    pub(super) fn unmap(mapping: &mut Mapping) {
        // SAFETY: `ptr`/`len` came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(mapping.ptr.cast(), mapping.len);
        }
    }

    pub(super) fn process_alive(pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks that the process exists.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(not(unix))]
mod os {
    use std::fs::File;
    use std::io;

    use super::Mapping;

    pub(super) fn map(_file: &File, _len: usize) -> io::Result<Mapping> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub(super) fn unmap(_mapping: &mut Mapping) {}

    pub(super) fn process_alive(_pid: u32) -> bool {
        false
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        os::unmap(self);
    }
}

// ── SharedRegion ──────────────────────────────────────────────────────────────

/// A fixed set of equally sized slots with per-slot reader counts, shared
/// between processes.
#[derive(Debug)]
pub struct SharedRegion {
    name: String,
    path: PathBuf,
    slots: usize,
    slot_size: usize,
    data: usize,
    /// This process created the file and unlinks it on drop.
    owner: bool,
    map: Mapping,
}

fn registry() -> &'static Mutex<HashMap<String, Weak<SharedRegion>>> {
    static REGIONS: OnceLock<Mutex<HashMap<String, Weak<SharedRegion>>>> = OnceLock::new();
    REGIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl SharedRegion {
    /// Maps the region called `name`, creating it with `slots` slots of
    /// `slot_size` bytes when no live process has created it yet.
    ///
    /// An existing region keeps its original geometry.
    ///
    /// # Errors
    ///
    /// [`TransportError::RegionUnavailable`] when the backing file cannot be
    /// created, opened, or mapped.
    pub fn open(
        name: &str,
        slots: usize,
        slot_size: usize,
    ) -> Result<Arc<SharedRegion>, TransportError> {
        let mut regions = registry().lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = regions.get(name).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let region = Self::map_file(name, slots.max(1), slot_size).map_err(|source| {
            TransportError::RegionUnavailable {
                region: name.to_string(),
                source,
            }
        })?;
        debug!(
            region = name,
            slots = region.slots,
            slot_size = region.slot_size,
            owner = region.owner,
            path = %region.path.display(),
            "shared region mapped"
        );
        let region = Arc::new(region);
        regions.insert(name.to_string(), Arc::downgrade(&region));
        Ok(region)
    }

    /// Returns the region called `name` if some channel in this process
    /// still holds it.
    pub fn lookup(name: &str) -> Option<Arc<SharedRegion>> {
        registry()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(Weak::upgrade)
    }

    fn map_file(name: &str, slots: usize, slot_size: usize) -> io::Result<SharedRegion> {
        let path = region_path(name);
        for _ in 0..OPEN_ATTEMPTS {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    let created = Self::create(name, &path, &file, slots, slot_size);
                    if created.is_err() {
                        let _ = fs::remove_file(&path);
                    }
                    return created;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            if let Some(region) = Self::attach(name, &path)? {
                return Ok(region);
            }
            warn!(region = name, path = %path.display(), "replacing stale shared region");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Err(io::ErrorKind::AlreadyExists.into())
    }

    fn create(
        name: &str,
        path: &Path,
        file: &File,
        slots: usize,
        slot_size: usize,
    ) -> io::Result<SharedRegion> {
        let (data, len) = layout(slots, slot_size);
        let slot_count = u32::try_from(slots).map_err(|_| io::ErrorKind::InvalidInput)?;
        let size = u32::try_from(slot_size).map_err(|_| io::ErrorKind::InvalidInput)?;
        // A fresh file reads as zeros: every slot free.
        file.set_len(len as u64)?;
        let map = os::map(file, len)?;
        map.word(1).store(slot_count, Ordering::Relaxed);
        map.word(2).store(size, Ordering::Relaxed);
        map.word(3).store(std::process::id(), Ordering::Relaxed);
        map.word(0).store(MAGIC, Ordering::Release);
        Ok(SharedRegion {
            name: name.to_string(),
            path: path.to_path_buf(),
            slots,
            slot_size,
            data,
            owner: true,
            map,
        })
    }

    /// Maps a file another process created.  `Ok(None)` means the file is
    /// stale and should be replaced.
    fn attach(name: &str, path: &Path) -> io::Result<Option<SharedRegion>> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let deadline = Instant::now() + INIT_WAIT;
        loop {
            let len = usize::try_from(file.metadata()?.len()).unwrap_or(0);
            if len >= HEADER_WORDS * 4 {
                let map = os::map(&file, len)?;
                if map.word(0).load(Ordering::Acquire) == MAGIC {
                    let slots = map.word(1).load(Ordering::Relaxed) as usize;
                    let slot_size = map.word(2).load(Ordering::Relaxed) as usize;
                    let creator = map.word(3).load(Ordering::Relaxed);
                    let (data, expected) = layout(slots, slot_size);
                    // Our own pid here means a handle of ours is mid-drop.
                    let live = creator != std::process::id() && os::process_alive(creator);
                    if slots == 0 || expected != len || !live {
                        return Ok(None);
                    }
                    return Ok(Some(SharedRegion {
                        name: name.to_string(),
                        path: path.to_path_buf(),
                        slots,
                        slot_size,
                        data,
                        owner: false,
                        map,
                    }));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(STAGE_POLL);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// File backing this region.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots nobody is reading.
    pub fn free_slots(&self) -> usize {
        (0..self.slots)
            .filter(|&i| self.reader_count(i).load(Ordering::Acquire) == 0)
            .count()
    }

    /// Outstanding readers of `slot`.
    pub fn readers(&self, slot: SlotIndex) -> u32 {
        self.index(slot)
            .map_or(0, |i| self.reader_count(i).load(Ordering::Acquire))
    }

    /// Copies `frame` into a free slot that `readers` subscribers will
    /// release.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Codec`] when the frame is larger than a slot.
    /// - [`TransportError::AllocationFailure`] when no slot frees up within
    ///   `wait`.
    pub fn stage(
        &self,
        frame: &[u8],
        readers: u32,
        wait: Duration,
    ) -> Result<SlotIndex, TransportError> {
        if frame.len() > self.slot_size {
            return Err(CodecError::BufferOverflow {
                needed: frame.len(),
                available: self.slot_size,
            }
            .into());
        }

        let deadline = Instant::now() + wait;
        let readers = readers.max(1);
        let index = loop {
            if let Some(index) = self.claim(readers) {
                break index;
            }
            if Instant::now() >= deadline {
                return Err(TransportError::AllocationFailure {
                    region: self.name.clone(),
                });
            }
            thread::sleep(STAGE_POLL);
        };

        // SAFETY: the claim reserves the slot until its readers release it,
        // and the frame fits in `slot_size`.
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), self.slot_ptr(index), frame.len());
        }
        // Fits in u32: `frame.len() <= slot_size`, which the header stores as u32.
        self.frame_len(index)
            .store(frame.len() as u32, Ordering::Release);
        Ok(SlotIndex(index as u32))
    }

    /// Loads the frame staged in `slot` into `buf`.
    pub fn read_into(&self, slot: SlotIndex, buf: &mut MessageBuffer) -> Result<(), TransportError> {
        let index = self
            .index(slot)
            .filter(|&i| self.reader_count(i).load(Ordering::Acquire) > 0)
            .ok_or_else(|| {
                CodecError::MalformedPayload(format!(
                    "slot {} of region {} is not staged",
                    slot.0, self.name
                ))
            })?;
        let len = (self.frame_len(index).load(Ordering::Acquire) as usize).min(self.slot_size);
        // SAFETY: a staged slot is not rewritten until every reader released it.
        let frame = unsafe { std::slice::from_raw_parts(self.slot_ptr(index), len) };
        buf.load_frame(frame)?;
        Ok(())
    }

    /// Drops one reader of `slot`; the last release frees the slot.
    pub fn release(&self, slot: SlotIndex) {
        let Some(index) = self.index(slot) else {
            return;
        };
        let released = self.reader_count(index).fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
        if released.is_err() {
            debug!(region = %self.name, slot = slot.0, "release of a free slot ignored");
        }
    }

    /// Reserves the first free slot for `readers`.
    fn claim(&self, readers: u32) -> Option<usize> {
        (0..self.slots).find(|&i| {
            self.reader_count(i)
                .compare_exchange(0, readers, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    fn index(&self, slot: SlotIndex) -> Option<usize> {
        let index = slot.0 as usize;
        (index < self.slots).then_some(index)
    }

    fn reader_count(&self, index: usize) -> &AtomicU32 {
        self.map.word(HEADER_WORDS + SLOT_WORDS * index)
    }

    fn frame_len(&self, index: usize) -> &AtomicU32 {
        self.map.word(HEADER_WORDS + SLOT_WORDS * index + 1)
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: `index < slots`, so the offset stays inside the mapping.
        unsafe { self.map.ptr.add(self.data + index * self.slot_size) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let mut regions = registry().lock().unwrap_or_else(PoisonError::into_inner);
        // A newer handle may have taken the name already.
        let retired = regions
            .get(&self.name)
            .map_or(true, |w| w.strong_count() == 0);
        if !retired {
            return;
        }
        regions.remove(&self.name);
        if self.owner {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(region = %self.name, error = %e, "shared region file not removed");
                }
            }
        }
        debug!(region = %self.name, owner = self.owner, "shared region unmapped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message: i16) -> Vec<u8> {
        let mut buf = MessageBuffer::new(16);
        buf.set_message_number(modlink_core::MessageNum(message));
        buf.write(&42u32).unwrap();
        buf.finalize_size();
        buf.to_frame()
    }

    /// Region names are files on the host, so every run gets its own.
    fn unique(name: &str) -> String {
        format!("{name}-{}", std::process::id())
    }

    #[test]
    fn test_slot_is_freed_after_last_reader() {
        // Arrange
        let region = SharedRegion::open(&unique("test-region-readers"), 2, 64).unwrap();
        let slot = region.stage(&frame(1), 2, Duration::ZERO).unwrap();

        // Act
        region.release(slot);
        let after_first = region.free_slots();
        region.release(slot);

        // Assert
        assert_eq!(after_first, 1, "slot stays pinned while a reader remains");
        assert_eq!(region.free_slots(), 2);
    }

    #[test]
    fn test_stage_fails_when_region_is_full() {
        // Arrange
        let region = SharedRegion::open(&unique("test-region-full"), 1, 64).unwrap();
        region.stage(&frame(1), 1, Duration::ZERO).unwrap();

        // Act
        let result = region.stage(&frame(2), 1, Duration::from_millis(20));

        // Assert
        assert!(matches!(
            result,
            Err(TransportError::AllocationFailure { .. })
        ));
    }

    #[test]
    fn test_stage_waits_for_a_release() {
        // Arrange
        let region = SharedRegion::open(&unique("test-region-wait"), 1, 64).unwrap();
        let slot = region.stage(&frame(1), 1, Duration::ZERO).unwrap();
        let releaser = Arc::clone(&region);

        // Act
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            releaser.release(slot);
        });
        let second = region.stage(&frame(2), 1, Duration::from_secs(2));
        handle.join().unwrap();

        // Assert
        assert_eq!(second.unwrap(), slot);
    }

    #[test]
    fn test_read_into_loads_staged_frame() {
        let region = SharedRegion::open(&unique("test-region-read"), 1, 64).unwrap();
        let slot = region.stage(&frame(3), 1, Duration::ZERO).unwrap();
        let mut buf = MessageBuffer::new(16);

        region.read_into(slot, &mut buf).unwrap();

        assert_eq!(buf.message_number(), modlink_core::MessageNum(3));
        assert_eq!(buf.read::<u32>().unwrap(), 42);
    }

    #[test]
    fn test_open_returns_existing_region() {
        let name = unique("test-region-shared");
        let first = SharedRegion::open(&name, 2, 64).unwrap();
        let second = SharedRegion::open(&name, 9, 8).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.slot_size(), 64);
    }

    #[test]
    fn test_region_and_its_file_go_with_last_handle() {
        // Arrange
        let name = unique("test-region-dropped");
        let region = SharedRegion::open(&name, 1, 8).unwrap();
        let path = region.path().to_path_buf();
        assert!(SharedRegion::lookup(&name).is_some());
        assert!(path.exists());

        // Act
        drop(region);

        // Assert
        assert!(SharedRegion::lookup(&name).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let region = SharedRegion::open(&unique("test-region-small"), 1, 4).unwrap();

        let result = region.stage(&[0u8; 16], 1, Duration::ZERO);

        assert!(matches!(result, Err(TransportError::Codec(_))));
        assert_eq!(region.free_slots(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_second_mapping_sees_slots_of_the_first() {
        // Arrange: a second, independent mapping of the same file stands in
        // for a subscriber process.
        let name = unique("test-region-two-maps");
        let publisher = SharedRegion::open(&name, 2, 64).unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(publisher.path())
            .unwrap();
        let subscriber = SharedRegion {
            name: name.clone(),
            path: publisher.path().to_path_buf(),
            slots: 2,
            slot_size: 64,
            data: layout(2, 64).0,
            owner: false,
            map: os::map(&file, layout(2, 64).1).unwrap(),
        };

        // Act
        let slot = publisher.stage(&frame(7), 1, Duration::ZERO).unwrap();
        let mut buf = MessageBuffer::new(16);
        subscriber.read_into(slot, &mut buf).unwrap();
        let free_while_read = publisher.free_slots();
        subscriber.release(slot);

        // Assert
        assert_eq!(buf.message_number(), modlink_core::MessageNum(7));
        assert_eq!(buf.read::<u32>().unwrap(), 42);
        assert_eq!(free_while_read, 1);
        assert_eq!(publisher.free_slots(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_leftover_file_of_a_dead_creator_is_replaced() {
        // Arrange: a file whose creator pid cannot exist, with slot 0 pinned.
        let name = unique("test-region-stale");
        let path = region_path(&name);
        let (_, len) = layout(1, 8);
        let mut words = vec![0u32; len / 4];
        words[0] = MAGIC;
        words[1] = 1;
        words[2] = 8;
        words[3] = u32::MAX;
        words[HEADER_WORDS] = 1;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        fs::write(&path, bytes).unwrap();

        // Act
        let region = SharedRegion::open(&name, 2, 16).unwrap();

        // Assert
        assert_eq!(region.free_slots(), 2);
        assert_eq!(region.slot_size(), 16);
    }
}
