//! Async Object-Cache Service (AOCS) — spec §2 item 5, §4.3, §6, §9.
//!
//! Persists translated code across runs and loads cached regions on
//! demand so JIT threads rarely block on I/O. One long-running worker
//! drains two priority-ordered queues (named-region add/remove, then bulk
//! serialization jobs) against two region maps (relocated by final load
//! address, unrelocated by on-disk original base — SPEC_FULL.md §3 "Two
//! independent entry maps").
//!
//! Grounded in `original_source`'s `Interface/Core/ObjectCache/*` for the
//! state machine, locking discipline, and on-disk header layout, and in
//! the teacher's direct-`libc` style (`src/mem.rs`) for the advisory file
//! lock. Concurrency primitives (`parking_lot`, `crossbeam-channel`) and
//! hashing (`twox-hash`) follow SPEC_FULL.md §2's ambient-stack decisions.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use twox_hash::XxHash64;

use crate::config::{Config, SerializationConfig};
use crate::error::ObjectCacheError;

/// `"FEXC"` read as a big-endian `u32`, packed into the header cookie as
/// spec §6 describes: `magic "FEXC" << 32 | code_version`.
const COOKIE_MAGIC: u32 = u32::from_be_bytes(*b"FEXC");
/// Bumped whenever [`CodeObjectSerializationHeader`]'s on-disk layout
/// changes in an incompatible way.
const CODE_VERSION: u32 = 1;

fn expected_cookie() -> u64 {
    ((COOKIE_MAGIC as u64) << 32) | CODE_VERSION as u64
}

/// XXH64 seed used for both the guest-code and host-code fingerprints
/// (spec §9 open question: "a 64-bit non-cryptographic hash with good
/// avalanche" — XXH64 satisfies this and is the algorithm the original
/// depends on but never wires up).
const HASH_SEED: u64 = 0x4645_5843_0000_0001; // "FEXC" + version, reused as a seed

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(HASH_SEED);
    h.write(bytes);
    h.finish()
}

/// Bit-exact on-disk header (spec §6). 72 bytes, tightly packed,
/// little-endian, no implicit padding — built by hand rather than via
/// `#[repr(C)]` so the wire layout can never drift from what
/// [`Self::to_bytes`]/[`Self::from_bytes`] actually read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeObjectSerializationHeader {
    pub cookie_version: u64,
    pub arch: u32,
    pub flags: u32,
    pub max_inst_per_block: u32,
    pub abi_local_flags: u32,
    pub original_base: u64,
    pub original_offset: u64,
    pub total_code_size: u64,
    pub num_code_entries: u64,
    pub num_relocations_to_this_section: u64,
    pub total_relocations_count: u64,
}

pub const HEADER_SIZE: usize = 72;

impl CodeObjectSerializationHeader {
    pub fn new(sc: SerializationConfig, original_base: u64, original_offset: u64) -> Self {
        CodeObjectSerializationHeader {
            cookie_version: expected_cookie(),
            arch: 0, // AArch64 host is the only target this crate emits for (spec §1).
            flags: sc.to_flags_word(),
            max_inst_per_block: sc.max_inst_per_block,
            abi_local_flags: 0,
            original_base,
            original_offset,
            total_code_size: 0,
            num_code_entries: 0,
            num_relocations_to_this_section: 0,
            total_relocations_count: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut w = 0usize;
        macro_rules! put {
            ($val:expr) => {{
                let bytes = $val.to_le_bytes();
                out[w..w + bytes.len()].copy_from_slice(&bytes);
                w += bytes.len();
            }};
        }
        put!(self.cookie_version);
        put!(self.arch);
        put!(self.flags);
        put!(self.max_inst_per_block);
        put!(self.abi_local_flags);
        put!(self.original_base);
        put!(self.original_offset);
        put!(self.total_code_size);
        put!(self.num_code_entries);
        put!(self.num_relocations_to_this_section);
        put!(self.total_relocations_count);
        debug_assert_eq!(w, HEADER_SIZE);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ObjectCacheError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ObjectCacheError::Corrupt("header shorter than 72 bytes"));
        }
        let mut r = 0usize;
        macro_rules! take {
            ($ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let v = <$ty>::from_le_bytes(bytes[r..r + N].try_into().unwrap());
                r += N;
                v
            }};
        }
        let header = CodeObjectSerializationHeader {
            cookie_version: take!(u64),
            arch: take!(u32),
            flags: take!(u32),
            max_inst_per_block: take!(u32),
            abi_local_flags: take!(u32),
            original_base: take!(u64),
            original_offset: take!(u64),
            total_code_size: take!(u64),
            num_code_entries: take!(u64),
            num_relocations_to_this_section: take!(u64),
            total_relocations_count: take!(u64),
        };
        if header.cookie_version != expected_cookie() {
            return Err(ObjectCacheError::CookieMismatch {
                found: header.cookie_version,
                expected: expected_cookie(),
            });
        }
        Ok(header)
    }
}

/// One relocation (spec §3/§6 "relocation table"): a host-code-relative
/// offset plus the addend to apply once the region's final load address
/// is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub host_offset: u64,
    pub addend: i64,
}

/// A decoded per-entry descriptor from the on-disk format (spec §6:
/// "array of per-entry descriptors (guest RIP, host code offset, host code
/// length, relocation count, relocation offset)").
#[derive(Debug, Clone)]
pub struct CodeObjectFileSection {
    pub guest_rip: u64,
    /// Set once this section's bytes have been durably written (spec §3:
    /// `Serialized ⇒ ¬Invalid`).
    pub serialized: bool,
    /// Set on any integrity failure; such sections must never be returned
    /// to a lookup (spec §3 invariant).
    pub invalid: bool,
    pub host_code: Arc<[u8]>,
    pub relocations: Vec<Relocation>,
}

/// State machine for one [`CodeRegionEntry`] (spec §4.2 "State machine per
/// region entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Registering,
    Ready,
    Removing,
    Corrupt,
    Gone,
}

/// A contiguous guest memory range tracked for cache and invalidation
/// purposes (spec glossary "Region"; spec §3 `CodeRegionEntry`).
pub struct CodeRegionEntry {
    pub base: u64,
    pub size: u64,
    pub file_offset: u64,
    pub filename: PathBuf,

    state: RwLock<RegionState>,
    /// Spec §3: "while `NamedJobRefCount` is held in writer mode, the
    /// entry is not yet usable for lookups". Producers take the writer
    /// side across the add/remove's async boundary via
    /// [`parking_lot::RwLock::raw`] rather than a scope-bound guard, since
    /// the lock must outlive the call that acquires it (released later by
    /// the worker).
    named_job_refcount: RwLock<()>,
    /// Spec §3: "while `ObjectJobRefCount` holds any reader, the entry may
    /// not be removed". Held in reader mode by every in-flight
    /// serialization job referencing this region.
    object_job_refcount: RwLock<()>,

    sections: RwLock<Vec<CodeObjectFileSection>>,
    section_index: RwLock<std::collections::HashMap<u64, usize>>,
    /// Snapshot of the live [`Config`]'s fingerprint at the moment this
    /// region was registered (spec §4.3 "Fingerprint"), used to build or
    /// validate the on-disk header.
    serialization_config: SerializationConfig,

    /// Amortizes file-lock setup across a burst of serialization jobs
    /// against the same region (spec §4.3 "Bursts are amortised...",
    /// SPEC_FULL.md §3 "Per-entry long-lived FD").
    current_fd: Mutex<Option<File>>,

    still_serializing: AtomicBool,
    /// Published with release semantics once a load/add completes;
    /// observed with acquire semantics by lookups (spec §9 open question
    /// 3, decided in SPEC_FULL.md §5.3).
    ready: AtomicBool,
}

impl CodeRegionEntry {
    fn new(
        base: u64,
        size: u64,
        file_offset: u64,
        filename: PathBuf,
        serialization_config: SerializationConfig,
    ) -> Arc<Self> {
        Arc::new(CodeRegionEntry {
            base,
            size,
            file_offset,
            filename,
            state: RwLock::new(RegionState::Registering),
            named_job_refcount: RwLock::new(()),
            object_job_refcount: RwLock::new(()),
            sections: RwLock::new(Vec::new()),
            section_index: RwLock::new(std::collections::HashMap::new()),
            serialization_config,
            current_fd: Mutex::new(None),
            still_serializing: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> RegionState {
        *self.state.read()
    }

    pub fn contains(&self, guest_ip: u64) -> bool {
        guest_ip >= self.base && guest_ip < self.base + self.size
    }

    /// Spec §9 open question 1 decision (SPEC_FULL.md §5.1): demote the
    /// instant any integrity check fails, no threshold.
    fn mark_corrupt(&self) {
        *self.state.write() = RegionState::Corrupt;
        self.still_serializing.store(false, Ordering::Relaxed);
    }

    fn mark_ready(&self) {
        *self.state.write() = RegionState::Ready;
        self.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn section_for(&self, guest_ip: u64) -> Option<CodeObjectFileSection> {
        if !self.is_ready() {
            return None;
        }
        let offset = guest_ip.checked_sub(self.base)?;
        let idx = *self.section_index.read().get(&offset)?;
        let sections = self.sections.read();
        let section = sections.get(idx)?;
        if section.invalid {
            return None;
        }
        Some(section.clone())
    }
}

/// Producer-side payload for spec §4.3's named-region add job, carrying
/// the map iterator (here: the `Arc<CodeRegionEntry>` itself, which plays
/// the same "stable handle across insert/erase" role as the original's
/// map iterator per spec §3 "Ownership rules").
struct AddNamedRegionWork {
    entry: Arc<CodeRegionEntry>,
}

struct RemoveNamedRegionWork {
    entry: Arc<CodeRegionEntry>,
}

enum NamedWorkItem {
    Add(AddNamedRegionWork),
    Remove(RemoveNamedRegionWork),
}

/// Spec §3 `SerializationJobData`. Hashes are computed by the producer
/// before enqueue (spec §4.3) so backpatching races are detectable on
/// dequeue.
#[derive(Clone)]
pub struct SerializationJobData {
    pub guest_ip: u64,
    pub guest_code: Arc<[u8]>,
    pub guest_code_hash: u64,
    pub host_code: Arc<[u8]>,
    pub host_code_hash: u64,
    pub region: Arc<CodeRegionEntry>,
    pub relocations: Vec<Relocation>,
    /// Reader guard held against the owning thread's refcount for the
    /// lifetime of this job (spec §4.3/§5); released by the worker on
    /// completion via [`AsyncObjectCacheService::handle_serialize_job`].
    pub thread_refcount: Arc<RwLock<()>>,
}

impl SerializationJobData {
    /// Builds a job, computing both hashes up front (spec §4.3).
    pub fn new(
        guest_ip: u64,
        guest_code: Arc<[u8]>,
        host_code: Arc<[u8]>,
        region: Arc<CodeRegionEntry>,
        relocations: Vec<Relocation>,
        thread_refcount: Arc<RwLock<()>>,
    ) -> Self {
        let guest_code_hash = hash_bytes(&guest_code);
        let host_code_hash = hash_bytes(&host_code);
        SerializationJobData {
            guest_ip,
            guest_code,
            guest_code_hash,
            host_code,
            host_code_hash,
            region,
            relocations,
            thread_refcount,
        }
    }
}

/// Producer-facing handle returned by [`AsyncObjectCacheService::async_add_serialization_job`]
/// so the caller can later block with [`AsyncObjectCacheService::wait_for_empty_job_queue`].
pub type ThreadRefCount = Arc<RwLock<()>>;

/// Async Object-Cache Service (spec §4.3). One worker thread drains the
/// named-region queue (priority) and the serialization queue against two
/// region maps keyed by final load address and by on-disk original base
/// respectively (SPEC_FULL.md §3).
pub struct AsyncObjectCacheService {
    relocated: Arc<RwLock<BTreeMap<u64, Arc<CodeRegionEntry>>>>,
    unrelocated: Arc<RwLock<BTreeMap<u64, Arc<CodeRegionEntry>>>>,
    named_tx: Sender<NamedWorkItem>,
    serialize_tx: Sender<SerializationJobData>,
    shutdown_flag: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cfg: Config,
}

impl AsyncObjectCacheService {
    /// Spawns the worker thread. If `cfg.object_cache` is
    /// [`crate::config::ObjectCacheMode::None`] the service still starts
    /// (so call sites don't need to special-case it) but every producer
    /// call below is a cheap enqueue-and-drain no-op in practice, since no
    /// caller should be constructing jobs when persistence is disabled.
    pub fn start(cfg: Config) -> Self {
        let relocated = Arc::new(RwLock::new(BTreeMap::new()));
        let unrelocated = Arc::new(RwLock::new(BTreeMap::new()));
        let (named_tx, named_rx) = crossbeam_channel::unbounded::<NamedWorkItem>();
        let (serialize_tx, serialize_rx) = crossbeam_channel::unbounded::<SerializationJobData>();
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let worker_relocated = relocated.clone();
        let worker_shutdown = shutdown_flag.clone();
        let handle = std::thread::Builder::new()
            .name("aocs-worker".into())
            .spawn(move || worker_loop(worker_relocated, named_rx, serialize_rx, worker_shutdown))
            .expect("failed to spawn AOCS worker thread");

        AsyncObjectCacheService {
            relocated,
            unrelocated,
            named_tx,
            serialize_tx,
            shutdown_flag,
            worker: Mutex::new(Some(handle)),
            cfg,
        }
    }

    /// `async_add_named_region(base, size, offset, filename)` (spec §6).
    ///
    /// Spec §4.3 steps 1-4: builds the entry, takes its `NamedJobRefCount`
    /// writer lock (so concurrent lookups block until the worker finishes
    /// loading it), inserts into both region maps, and enqueues the work
    /// item. If an entry already exists at `base`, its predecessor's add is
    /// waited on before being replaced (spec §4.3 step 3).
    pub fn async_add_named_region(&self, base: u64, size: u64, offset: u64, filename: impl AsRef<Path>) {
        let filename = filename.as_ref().to_path_buf();
        let entry = CodeRegionEntry::new(base, size, offset, filename, self.cfg.serialization_config());
        unsafe {
            entry.named_job_refcount.raw().lock_exclusive();
        }

        {
            let mut relocated = self.relocated.write();
            if let Some(previous) = relocated.remove(&base) {
                // Step 3: wait for the outgoing entry's own add to finish,
                // then close it out before it's dropped.
                previous.named_job_refcount.read();
                self.do_code_region_closure(&previous);
                self.unrelocated.write().remove(&previous.file_offset);
            }
            relocated.insert(base, entry.clone());
        }
        self.unrelocated.write().insert(offset, entry.clone());

        let _ = self.named_tx.send(NamedWorkItem::Add(AddNamedRegionWork { entry }));
    }

    /// `async_remove_named_region(base, size)` (spec §6).
    ///
    /// Spec §4.3 steps 1-2: acquires the writer lock (blocking behind any
    /// outstanding add), then moves the entry out of both maps before
    /// handing it to the worker for final closure.
    pub fn async_remove_named_region(&self, base: u64, _size: u64) {
        let entry = match self.relocated.write().remove(&base) {
            Some(e) => e,
            None => return,
        };
        self.unrelocated.write().remove(&entry.file_offset);

        unsafe {
            entry.named_job_refcount.raw().lock_exclusive();
        }
        *entry.state.write() = RegionState::Removing;

        let _ = self.named_tx.send(NamedWorkItem::Remove(RemoveNamedRegionWork { entry }));
    }

    /// `async_add_serialization_job(job_data)` (spec §6). The caller has
    /// already hashed both guest and host code (spec §4.3) and is expected
    /// to hold a reader on `job_data.thread_refcount` for the job's
    /// lifetime; this call takes that same reader (crossing the async
    /// boundary via the raw lock, released by the worker on completion)
    /// and a reader on the region's `ObjectJobRefCount`.
    pub fn async_add_serialization_job(&self, job: SerializationJobData) {
        if matches!(self.cfg.object_cache, crate::config::ObjectCacheMode::None) {
            return;
        }
        unsafe {
            job.thread_refcount.raw().lock_shared();
            job.region.object_job_refcount.raw().lock_shared();
        }
        let _ = self.serialize_tx.send(job);
    }

    /// `fetch_code_object_from_cache(guest_ip) -> Option<&CodeObjectFileSection>`
    /// (spec §6). Returns an owned snapshot rather than a borrow — spec §9's
    /// "break cyclic pointer graphs with arena indices" applies equally to
    /// the caller-facing return value, since a `&'_ CodeObjectFileSection`
    /// tied to an internal lock guard isn't expressible without `unsafe`.
    ///
    /// Blocks briefly on the owning region's `NamedJobRefCount` reader lock
    /// if an add is still in flight (spec §5 "JIT lookup may block briefly
    /// on a region's `NamedJobRefCount` reader lock").
    pub fn fetch_code_object_from_cache(&self, guest_ip: u64) -> Option<CodeObjectFileSection> {
        let entry = {
            let relocated = self.relocated.read();
            relocated
                .range(..=guest_ip)
                .next_back()
                .map(|(_, e)| e.clone())
                .filter(|e| e.contains(guest_ip))?
        };
        let _reader = entry.named_job_refcount.read();
        if matches!(entry.state(), RegionState::Corrupt | RegionState::Gone | RegionState::Removing) {
            return None;
        }
        entry.section_for(guest_ip)
    }

    /// `wait_for_empty_job_queue(thread_refcount)` (spec §6, SPEC_FULL.md §3
    /// "WaitForEmptyJobQueue"): synchronously drains every job still
    /// referencing `thread_refcount`, distinct from [`Self::shutdown`] —
    /// used when a single guest thread exits without tearing down the
    /// whole service (spec §5 "Thread exit").
    pub fn wait_for_empty_job_queue(&self, thread_refcount: &ThreadRefCount) {
        unsafe {
            thread_refcount.raw().lock_exclusive();
            thread_refcount.raw().unlock_exclusive();
        }
    }

    /// Region-closure routine (SPEC_FULL.md §3 `DoCodeRegionClosure`):
    /// flushes any `StillSerializing` work and releases the backing file
    /// mapping. Invoked both when an entry is replaced and during
    /// shutdown, distinct from simple map removal.
    fn do_code_region_closure(&self, entry: &Arc<CodeRegionEntry>) {
        entry.still_serializing.store(false, Ordering::Relaxed);
        *entry.current_fd.lock() = None;
    }

    /// `shutdown()` (spec §5): sets the shared flag, signals the worker,
    /// and joins it. The worker finishes its current item, then runs
    /// closure on every remaining entry; pending serialization jobs are
    /// dropped undelivered.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncObjectCacheService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    relocated: Arc<RwLock<BTreeMap<u64, Arc<CodeRegionEntry>>>>,
    named_rx: Receiver<NamedWorkItem>,
    serialize_rx: Receiver<SerializationJobData>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let mut did_work = false;

        // Spec §5: "the named-region queue is drained before the
        // serialization queue within each worker wake".
        while let Ok(item) = named_rx.try_recv() {
            did_work = true;
            handle_named_item(item);
        }
        while let Ok(job) = serialize_rx.try_recv() {
            did_work = true;
            handle_serialize_job(job);
        }

        if did_work {
            continue;
        }

        if shutdown.load(Ordering::Acquire) {
            break;
        }

        crossbeam_channel::select! {
            recv(named_rx) -> item => { if let Ok(item) = item { handle_named_item(item); } },
            recv(serialize_rx) -> job => { if let Ok(job) = job { handle_serialize_job(job); } },
            default(Duration::from_millis(25)) => {},
        }
    }

    // Spec §4.3 "Closure on shutdown walks every live entry once."
    for entry in relocated.read().values() {
        entry.still_serializing.store(false, Ordering::Relaxed);
        *entry.current_fd.lock() = None;
    }
}

fn handle_named_item(item: NamedWorkItem) {
    match item {
        NamedWorkItem::Add(work) => {
            let entry = work.entry;
            match load_region_from_disk(&entry) {
                Ok(()) => entry.mark_ready(),
                Err(_) => entry.mark_corrupt(),
            }
            unsafe {
                entry.named_job_refcount.raw().unlock_exclusive();
            }
        }
        NamedWorkItem::Remove(work) => {
            let entry = work.entry;
            entry.still_serializing.store(false, Ordering::Relaxed);
            *entry.current_fd.lock() = None;
            *entry.state.write() = RegionState::Gone;
            unsafe {
                entry.named_job_refcount.raw().unlock_exclusive();
            }
        }
    }
}

/// Spec §4.3 step 5 ("Worker performs file I/O, header validation,
/// section-map construction"). Missing files are not an error here — a
/// region with nothing on disk yet simply starts `Ready` with no sections,
/// ready to accept serialization jobs.
fn load_region_from_disk(entry: &CodeRegionEntry) -> Result<(), ObjectCacheError> {
    let file = match File::open(&entry.filename) {
        Ok(f) => f,
        Err(_) => return Ok(()),
    };
    let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(ObjectCacheError::Io)?;
    let bytes: &[u8] = &mmap;
    if bytes.is_empty() {
        return Ok(());
    }

    let header = CodeObjectSerializationHeader::from_bytes(bytes)?;
    const DESC_SIZE: usize = 40;
    let descriptors_end = HEADER_SIZE + header.num_code_entries as usize * DESC_SIZE;
    if bytes.len() < descriptors_end {
        return Err(ObjectCacheError::Corrupt("truncated entry descriptor table"));
    }

    let mut sections = Vec::with_capacity(header.num_code_entries as usize);
    let mut index = std::collections::HashMap::new();

    for i in 0..header.num_code_entries as usize {
        let d = &bytes[HEADER_SIZE + i * DESC_SIZE..HEADER_SIZE + (i + 1) * DESC_SIZE];
        let guest_rip = u64::from_le_bytes(d[0..8].try_into().unwrap());
        let host_offset = u64::from_le_bytes(d[8..16].try_into().unwrap()) as usize;
        let host_len = u64::from_le_bytes(d[16..24].try_into().unwrap()) as usize;
        let reloc_count = u64::from_le_bytes(d[24..32].try_into().unwrap()) as usize;
        let reloc_offset = u64::from_le_bytes(d[32..40].try_into().unwrap()) as usize;

        if host_offset + host_len > bytes.len() {
            return Err(ObjectCacheError::Corrupt("host code range out of bounds"));
        }
        let host_code: Arc<[u8]> = Arc::from(&bytes[host_offset..host_offset + host_len]);

        let mut relocations = Vec::with_capacity(reloc_count);
        for r in 0..reloc_count {
            let off = reloc_offset + r * 16;
            if off + 16 > bytes.len() {
                return Err(ObjectCacheError::Corrupt("relocation table out of bounds"));
            }
            let host_offset = u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
            let addend = i64::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap());
            relocations.push(Relocation { host_offset, addend });
        }

        index.insert(guest_rip.wrapping_sub(entry.base), sections.len());
        sections.push(CodeObjectFileSection {
            guest_rip,
            serialized: true,
            invalid: false,
            host_code,
            relocations,
        });
    }

    *entry.sections.write() = sections;
    *entry.section_index.write() = index;
    Ok(())
}

fn handle_serialize_job(job: SerializationJobData) {
    let outcome = (|| -> Result<(), ObjectCacheError> {
        // Spec §4.3/§7 `InvalidationRaceDetected`: re-hash on dequeue.
        if hash_bytes(&job.guest_code) != job.guest_code_hash
            || hash_bytes(&job.host_code) != job.host_code_hash
        {
            return Err(ObjectCacheError::InvalidationRace { guest_rip: job.guest_ip });
        }
        if matches!(job.region.state(), RegionState::Corrupt) {
            // Corrupt regions refuse new serialize jobs (spec §4.2).
            return Ok(());
        }
        append_section(&job)
    })();

    if outcome.is_err() {
        job.region.mark_corrupt();
    }

    unsafe {
        job.region.object_job_refcount.raw().unlock_shared();
        job.thread_refcount.raw().unlock_shared();
    }
}

/// Appends one serialized code entry to the region's backing file, reusing
/// a long-lived file descriptor across bursts (spec §4.3 "Bursts are
/// amortised..."), and records an OS advisory range lock across the
/// header read-modify-write (spec §6).
fn append_section(job: &SerializationJobData) -> Result<(), ObjectCacheError> {
    let region = &job.region;
    let mut fd_guard = region.current_fd.lock();
    if fd_guard.is_none() {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&region.filename)?;
        *fd_guard = Some(file);
    }
    let file = fd_guard.as_mut().unwrap();

    lock_header_range(file)?;
    let result = (|| -> Result<(), ObjectCacheError> {
        let mut header = read_or_init_header(file, region)?;

        file.seek(SeekFrom::End(0))?;
        let host_offset = file.stream_position()?;
        file.write_all(&job.host_code)?;

        let reloc_offset = file.stream_position()?;
        for r in &job.relocations {
            file.write_all(&r.host_offset.to_le_bytes())?;
            file.write_all(&r.addend.to_le_bytes())?;
        }

        let descriptor_offset =
            HEADER_SIZE as u64 + header.num_code_entries * 40;
        header.num_code_entries += 1;
        header.total_code_size += job.host_code.len() as u64;
        header.total_relocations_count += job.relocations.len() as u64;

        file.seek(SeekFrom::Start(descriptor_offset))?;
        file.write_all(&job.guest_ip.to_le_bytes())?;
        file.write_all(&host_offset.to_le_bytes())?;
        file.write_all(&(job.host_code.len() as u64).to_le_bytes())?;
        file.write_all(&(job.relocations.len() as u64).to_le_bytes())?;
        file.write_all(&reloc_offset.to_le_bytes())?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        Ok(())
    })();
    unlock_header_range(file);
    result?;

    region.still_serializing.store(false, Ordering::Relaxed);
    Ok(())
}

fn read_or_init_header(
    file: &mut File,
    region: &CodeRegionEntry,
) -> Result<CodeObjectSerializationHeader, ObjectCacheError> {
    let len = file.metadata()?.len();
    if len >= HEADER_SIZE as u64 {
        let mut buf = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        return CodeObjectSerializationHeader::from_bytes(&buf);
    }
    let header =
        CodeObjectSerializationHeader::new(region.serialization_config, region.base, region.file_offset);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.to_bytes())?;
    Ok(header)
}

/// Advisory range lock over the header bytes (spec §6: "writers must hold
/// an OS file lock across read-modify-write"), continuing the teacher's
/// direct-`libc` style (`src/mem.rs`) rather than reaching for a crate
/// wrapper for a single `fcntl` call.
fn lock_header_range(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let mut lock = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: HEADER_SIZE as i64,
        l_pid: 0,
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLKW, &mut lock as *mut _) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn unlock_header_range(file: &File) {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let mut lock = libc::flock {
        l_type: libc::F_UNLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: HEADER_SIZE as i64,
        l_pid: 0,
    };
    unsafe {
        libc::fcntl(fd, libc::F_SETLK, &mut lock as *mut _);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn poll_until<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn header_round_trips() {
        let sc = Config::default().serialization_config();
        let header = CodeObjectSerializationHeader::new(sc, 0x1000, 0);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let back = CodeObjectSerializationHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn bad_cookie_is_rejected_not_deleted() {
        let sc = Config::default().serialization_config();
        let mut header = CodeObjectSerializationHeader::new(sc, 0, 0);
        header.cookie_version = 0xdead_beef;
        let bytes = header.to_bytes();
        let err = CodeObjectSerializationHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ObjectCacheError::CookieMismatch { .. }));
    }

    #[test]
    fn hash_bytes_is_deterministic() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }

    #[test]
    fn add_named_region_becomes_ready_and_fetchable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("region.cache");

        let aocs = AsyncObjectCacheService::start(Config::default());
        aocs.async_add_named_region(0x1000, 0x1000, 0, &path);

        let relocated = aocs.relocated.clone();
        assert!(poll_until(
            || relocated.read().get(&0x1000).map(|e| e.state()) == Some(RegionState::Ready),
            Duration::from_secs(2)
        ));
        assert!(aocs.fetch_code_object_from_cache(0x1000).is_none());
        aocs.shutdown();
    }

    #[test]
    fn remove_then_missing_from_map() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("region2.cache");
        let aocs = AsyncObjectCacheService::start(Config::default());
        aocs.async_add_named_region(0x2000, 0x1000, 0, &path);
        assert!(poll_until(
            || aocs.relocated.read().get(&0x2000).map(|e| e.state()) == Some(RegionState::Ready),
            Duration::from_secs(2)
        ));

        aocs.async_remove_named_region(0x2000, 0x1000);
        assert!(aocs.relocated.read().get(&0x2000).is_none());
        aocs.shutdown();
    }

    #[test]
    fn serialize_then_reload_round_trips_host_code() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("region3.cache");

        {
            let aocs = AsyncObjectCacheService::start(Config {
                object_cache: crate::config::ObjectCacheMode::ReadWrite,
                ..Config::default()
            });
            aocs.async_add_named_region(0x3000, 0x1000, 0, &path);
            let relocated = aocs.relocated.clone();
            assert!(poll_until(
                || relocated.read().get(&0x3000).map(|e| e.state()) == Some(RegionState::Ready),
                Duration::from_secs(2)
            ));
            let region = relocated.read().get(&0x3000).unwrap().clone();

            let guest_code: Arc<[u8]> = Arc::from(&b"\x90\x90"[..]);
            let host_code: Arc<[u8]> = Arc::from(&b"\xD5\x03\x20\x1F"[..]); // AArch64 NOP, arbitrary payload
            let thread_refcount = Arc::new(RwLock::new(()));
            let job = SerializationJobData::new(
                0x3000,
                guest_code,
                host_code.clone(),
                region,
                Vec::new(),
                thread_refcount,
            );
            aocs.async_add_serialization_job(job);

            assert!(poll_until(|| path.exists() && std::fs::metadata(&path).unwrap().len() > 0, Duration::from_secs(2)));
            aocs.shutdown();
        }

        // Fresh service, fresh load: the on-disk bytes must survive.
        let aocs2 = AsyncObjectCacheService::start(Config::default());
        aocs2.async_add_named_region(0x3000, 0x1000, 0, &path);
        assert!(poll_until(
            || aocs2.relocated.read().get(&0x3000).map(|e| e.state()) == Some(RegionState::Ready),
            Duration::from_secs(2)
        ));
        let section = aocs2.fetch_code_object_from_cache(0x3000).expect("cache hit expected");
        assert_eq!(&*section.host_code, &b"\xD5\x03\x20\x1F"[..]);
        aocs2.shutdown();
    }
}
