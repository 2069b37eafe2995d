//! POSIX shared memory segment and named semaphore backing the producer/consumer handoff.
//!
//! The segment survives producer runs: [`SharedSegment`] unmaps and closes on drop but never
//! unlinks. Whoever owns the segment's lifetime (normally the consumer) calls
//! [`SharedSegment::remove`] and [`NamedSemaphore::remove`].

use std::ffi::CString;
use std::fs::{File, Permissions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::PermissionsExt;
use std::ptr::{self, NonNull};

use log::{debug, error, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::error::EngineError;
use crate::handoff::{HandoffPolicy, HandoffSlot, SnapshotSink};
use crate::snapshot::{segment_size, SegmentHeader, Snapshot, SnapshotRecord, LAYOUT_VERSION, SEGMENT_MAGIC};

const OBJECT_MODE: libc::mode_t = 0o666;

fn c_name(name: &str) -> Result<CString, EngineError> {
    CString::new(name).map_err(|_| EngineError::config(format!("'{}' contains a NUL byte", name)))
}

/// A named counting semaphore used as a binary mutex between processes.
pub struct NamedSemaphore {
    name: String,
    sem: NonNull<libc::sem_t>,
}

// sem_t operations are safe to call from any thread.
unsafe impl Send for NamedSemaphore {}

impl NamedSemaphore {
    /// Opens the semaphore, creating it unlocked (value 1) with mode 0666 if it does not exist.
    pub fn open_or_create(name: &str) -> Result<Self, EngineError> {
        let c_name = c_name(name)?;
        let (raw, err) = unsafe {
            // umask is cleared only around the call so the 0666 mode is applied as given.
            let previous = libc::umask(0);
            let raw = libc::sem_open(c_name.as_ptr(), libc::O_CREAT, OBJECT_MODE as libc::c_uint, 1 as libc::c_uint);
            let err = io::Error::last_os_error();
            libc::umask(previous);
            (raw, err)
        };
        if raw == libc::SEM_FAILED {
            return Err(EngineError::resource(format!("sem_open '{}'", name), err));
        }
        let sem = NonNull::new(raw).ok_or_else(|| EngineError::resource(format!("sem_open '{}'", name), err))?;
        debug!("Opened semaphore {}", name);
        Ok(NamedSemaphore { name: name.to_string(), sem })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Single non-blocking attempt. `Ok(false)` means someone else holds it.
    pub fn try_acquire(&self) -> Result<bool, EngineError> {
        loop {
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(EngineError::resource(format!("sem_trywait '{}'", self.name), err)),
            }
        }
    }

    /// Acquires under `policy`, returning a guard that releases on drop.
    pub fn acquire(&self, policy: &HandoffPolicy) -> Result<SemaphoreGuard<'_>, EngineError> {
        policy.run(|| self.try_acquire())?;
        Ok(SemaphoreGuard { sem: self })
    }

    pub fn release(&self) -> Result<(), EngineError> {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(EngineError::last_os(format!("sem_post '{}'", self.name)))
        }
    }

    /// Unlinks the semaphore name. A name that is already gone is not an error.
    pub fn remove(name: &str) -> Result<(), EngineError> {
        let c_name = c_name(name)?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(())
        } else {
            Err(EngineError::resource(format!("sem_unlink '{}'", name), err))
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_close(self.sem.as_ptr()) } != 0 {
            error!("sem_close '{}' failed: {}", self.name, io::Error::last_os_error());
        }
    }
}

/// Held exclusion on a [`NamedSemaphore`].
pub struct SemaphoreGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.release() {
            error!("Failed to release semaphore: {}", e);
        }
    }
}

/// A read/write MAP_SHARED mapping, unmapped on drop.
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn map(file: &File, len: usize, name: &str) -> Result<Self, EngineError> {
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(EngineError::last_os(format!("mmap '{}' ({} bytes)", name, len)));
        }
        let base = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| EngineError::resource(format!("mmap '{}'", name), io::Error::other("null mapping")))?;
        Ok(Mapping { base, len })
    }

    // SAFETY (both accessors): the mapping is `len` bytes and lives as long as `self`. Callers only
    // touch it while holding the segment semaphore, which a cooperating consumer also honours.
    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) } != 0 {
            error!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// Header and records copied out of the segment under exclusion.
#[derive(Debug, Clone)]
pub struct SegmentContents {
    pub header: SegmentHeader,
    pub records: Vec<SnapshotRecord>,
}

/// The producer's (or a consumer's) attachment to the named shared segment.
pub struct SharedSegment {
    name: String,
    capacity: usize,
    particle_count: usize,
    policy: HandoffPolicy,
    truncation_reported: bool,
    // Drop order: unmap, then close the descriptor, then close the semaphore.
    mapping: Mapping,
    _file: File,
    lock: NamedSemaphore,
}

impl SharedSegment {
    /// Opens or creates the segment `name` sized for `capacity` records and validates it against
    /// `particle_count`. The whole procedure runs while holding `semaphore_name`.
    pub fn attach(
        name: &str,
        semaphore_name: &str,
        capacity: usize,
        particle_count: usize,
        policy: HandoffPolicy,
    ) -> Result<Self, EngineError> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(EngineError::config(format!("invalid segment capacity {}", capacity)));
        }
        let lock = NamedSemaphore::open_or_create(semaphore_name)?;

        let (file, mapping, created) = {
            let _guard = lock.acquire(&policy)?;
            let (file, created) = open_object(name)?;
            let expected = segment_size(capacity);
            let actual = file
                .metadata()
                .map_err(|e| EngineError::resource(format!("fstat '{}'", name), e))?
                .len();

            if created || actual == 0 {
                file.set_len(expected as u64)
                    .map_err(|e| EngineError::resource(format!("ftruncate '{}'", name), e))?;
                if created {
                    file.set_permissions(Permissions::from_mode(OBJECT_MODE as u32))
                        .map_err(|e| EngineError::resource(format!("fchmod '{}'", name), e))?;
                }
            } else if actual != expected as u64 {
                return Err(EngineError::Consistency(format!(
                    "segment '{}' is {} bytes, layout v{} with capacity {} needs {}",
                    name, actual, LAYOUT_VERSION, capacity, expected
                )));
            }

            let mut mapping = Mapping::map(&file, expected, name)?;
            prepare_header(&mut mapping, created, name, capacity, particle_count)?;
            (file, mapping, created)
        };

        info!(
            "{} shared segment {} ({} record slots, {} particles), guarded by {}",
            if created { "Created" } else { "Attached to" },
            name,
            capacity,
            particle_count,
            semaphore_name
        );

        Ok(SharedSegment {
            name: name.to_string(),
            capacity,
            particle_count,
            policy,
            truncation_reported: false,
            mapping,
            _file: file,
            lock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn particle_count(&self) -> usize {
        self.particle_count
    }

    pub fn policy(&self) -> HandoffPolicy {
        self.policy
    }

    /// Consumer side: copies the current publication out under exclusion.
    pub fn read(&self) -> Result<SegmentContents, EngineError> {
        let _guard = self.lock.acquire(&self.policy)?;
        let (header, body) = SegmentHeader::read_from_prefix(self.mapping.bytes())
            .map_err(|_| EngineError::Consistency(format!("segment '{}' is smaller than its header", self.name)))?;

        let count = usize::try_from(header.count).unwrap_or(0).min(self.capacity);
        let records = body[..count * SnapshotRecord::SIZE]
            .chunks_exact(SnapshotRecord::SIZE)
            .map(|chunk| {
                SnapshotRecord::read_from_bytes(chunk)
                    .map_err(|_| EngineError::Consistency("misaligned record slot".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SegmentContents { header, records })
    }

    /// Unmaps and closes. The segment and its semaphore stay in place for the next run.
    pub fn detach(self) {
        info!("Detaching from shared segment {}", self.name);
    }

    /// Unlinks the segment name. A name that is already gone is not an error.
    pub fn remove(name: &str) -> Result<(), EngineError> {
        let c_name = c_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(())
        } else {
            Err(EngineError::resource(format!("shm_unlink '{}'", name), err))
        }
    }

    /// Writes a snapshot. Must only be called while `lock` is held.
    fn write_locked(&mut self, snapshot: &Snapshot) -> Result<usize, EngineError> {
        let written = snapshot.len().min(self.capacity);
        let requested = snapshot.truncated_from.unwrap_or(0).max(snapshot.len());
        if requested > written && !self.truncation_reported {
            warn!(
                "{}; publishing the first {} records",
                EngineError::Capacity { requested, capacity: self.capacity },
                written
            );
            self.truncation_reported = true;
        }

        let (head, body) = self.mapping.bytes_mut().split_at_mut(SegmentHeader::SIZE);
        body[..written * SnapshotRecord::SIZE].copy_from_slice(snapshot.records[..written].as_bytes());

        let (mut header, _) = SegmentHeader::read_from_prefix(&*head)
            .map_err(|_| EngineError::Consistency("segment header unreadable".to_string()))?;
        header.count = written as i32;
        header.sequence = header.sequence.wrapping_add(1);
        head.copy_from_slice(header.as_bytes());
        Ok(written)
    }
}

/// Exclusive access to a [`SharedSegment`]; the semaphore is posted when this is dropped.
pub struct PublishSlot<'a> {
    segment: &'a mut SharedSegment,
}

impl HandoffSlot for PublishSlot<'_> {
    fn write(&mut self, snapshot: &Snapshot) -> Result<usize, EngineError> {
        self.segment.write_locked(snapshot)
    }
}

impl Drop for PublishSlot<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.segment.lock.release() {
            error!("Failed to release handoff slot on {}: {}", self.segment.name, e);
        }
    }
}

impl SnapshotSink for SharedSegment {
    type Slot<'a> = PublishSlot<'a>;

    fn acquire_slot(&mut self) -> Result<PublishSlot<'_>, EngineError> {
        let lock = &self.lock;
        self.policy.run(|| lock.try_acquire())?;
        Ok(PublishSlot { segment: self })
    }

    fn describe(&self) -> String {
        format!("shared segment {} (guarded by {})", self.name, self.lock.name())
    }
}

/// Opens `name` read/write, creating it exclusively first. Returns whether it was created here.
fn open_object(name: &str) -> Result<(File, bool), EngineError> {
    let c_name = c_name(name)?;
    let fd = unsafe {
        libc::shm_open(c_name.as_ptr(), libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, OBJECT_MODE)
    };
    if fd >= 0 {
        return Ok((unsafe { File::from_raw_fd(fd) }, true));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EEXIST) {
        return Err(EngineError::resource(format!("shm_open '{}'", name), err));
    }
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
    if fd < 0 {
        return Err(EngineError::last_os(format!("shm_open '{}'", name)));
    }
    Ok((unsafe { File::from_raw_fd(fd) }, false))
}

/// Stamps a fresh or consumer-zeroed header, or checks a stamped one against this run.
fn prepare_header(
    mapping: &mut Mapping,
    created: bool,
    name: &str,
    capacity: usize,
    particle_count: usize,
) -> Result<(), EngineError> {
    let (header, _) = SegmentHeader::read_from_prefix(mapping.bytes())
        .map_err(|_| EngineError::Consistency(format!("segment '{}' is smaller than its header", name)))?;
    let requested = particle_count as i64;

    if created || !header.is_stamped() {
        // A consumer may pre-declare the population in an otherwise zeroed header.
        if !created && header.particle_count != 0 && i64::from(header.particle_count) != requested {
            return Err(EngineError::Consistency(format!(
                "segment '{}' was prepared for {} particles, this run has {}",
                name, header.particle_count, particle_count
            )));
        }
        let bytes = mapping.bytes_mut();
        bytes.fill(0);
        bytes[..SegmentHeader::SIZE].copy_from_slice(SegmentHeader::stamped(capacity, particle_count).as_bytes());
        return Ok(());
    }

    if header.magic != SEGMENT_MAGIC {
        return Err(EngineError::Consistency(format!(
            "segment '{}' has unrecognised magic {:#010x}",
            name, header.magic
        )));
    }
    if header.version != LAYOUT_VERSION {
        return Err(EngineError::Consistency(format!(
            "segment '{}' uses layout v{}, expected v{}",
            name, header.version, LAYOUT_VERSION
        )));
    }
    if header.capacity as usize != capacity {
        return Err(EngineError::Consistency(format!(
            "segment '{}' holds {} records, expected {}",
            name, header.capacity, capacity
        )));
    }
    if i64::from(header.particle_count) != requested {
        return Err(EngineError::Consistency(format!(
            "segment '{}' records {} particles, this run has {}",
            name, header.particle_count, particle_count
        )));
    }
    Ok(())
}
