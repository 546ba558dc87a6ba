//! The extraction pipeline: enumerate → read → scan → validate.
//!
//! One producer thread snapshots candidate regions in enumeration order and
//! feeds them through a bounded channel to a pool of scan workers. Workers
//! sweep each buffer back to front, resolve candidate pointers (in-buffer
//! when possible, point-read otherwise) and drive the shared [`Validator`].
//! The first validated key wins: it is posted on a one-slot result channel
//! and an internal cancellation token tears the rest of the run down.
//!
//! Backpressure comes from the channel bound; the memory ceiling from the
//! bound times the per-region size cap.

use std::thread;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde::Serialize;

use crate::backend::{select_backend, MemoryBackend, RegionReader};
use crate::cancel::CancelToken;
use crate::error::{ExtractError, ExtractResult};
use crate::region::{MemoryRegion, RegionBuffer};
use crate::scanner::{resolve_in_buffer, OffsetProbe, PointerScan};
use crate::validator::{Validator, KEY_SIZE, PAGE_SIZE};

/// Buffers in flight between the producer and the workers.
const REGION_CHANNEL_CAPACITY: usize = 100;
/// Regions above this are skipped outright; together with the channel bound
/// this caps resident buffer memory.
const MAX_REGION_SIZE: u64 = 100 * 1024 * 1024;
/// Hard cap on scan workers.
const MAX_WORKERS: usize = 16;
/// Floor so the producer always overlaps with at least one consumer.
const MIN_WORKERS: usize = 2;
/// Candidate pointers gathered per sweep pass before their point-reads are
/// issued; amortises the per-read syscall cost. Tuning knob, not a contract.
const CANDIDATE_BATCH: usize = 8;

/// How a validated key was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Pointer stored before the 24-byte anchor, dereferenced in the target.
    PointerChase,
    /// In-buffer window at a fixed displacement from the SQL-text anchor.
    OffsetProbe,
}

/// A validated key with the diagnostics of where it was found.
#[derive(Debug, Clone, Serialize)]
pub struct KeyFinding {
    /// 64 lowercase hex characters.
    pub key: String,
    /// Target-process address of the key bytes.
    pub address: u64,
    /// Base of the region whose sweep produced the hit.
    pub region_start: u64,
    pub strategy: Strategy,
}

/// Recover the database master key from the memory of process `pid`.
///
/// `first_page` is the first 4096 bytes of the encrypted database; `cancel`
/// lets the caller impose a deadline. On success the key is returned as 64
/// lowercase hex characters. Diagnostics are emitted on the log stream
/// only.
pub fn extract(pid: u32, first_page: &[u8; PAGE_SIZE], cancel: &CancelToken) -> ExtractResult<String> {
    let backend = select_backend()?;
    extract_with_backend(pid, first_page, cancel, &*backend)
}

/// [`extract`] over an explicit backend.
///
/// The entry point for callers that inject their own acquisition layer
/// (and for the test suite's simulated processes).
pub fn extract_with_backend(
    pid: u32,
    first_page: &[u8; PAGE_SIZE],
    cancel: &CancelToken,
    backend: &dyn MemoryBackend,
) -> ExtractResult<String> {
    let validator = Validator::new(first_page);
    if !validator.is_encrypted() {
        return Err(ExtractError::DatabaseNotEncrypted);
    }
    if cancel.is_cancelled() {
        return Err(ExtractError::Cancelled);
    }

    backend.probe(pid)?;
    let regions = backend.enumerate(pid)?;
    if regions.is_empty() {
        return Err(ExtractError::NoMemoryRegions);
    }
    tracing::debug!(
        backend = backend.name(),
        pid,
        regions = regions.len(),
        "enumerated candidate regions"
    );
    let reader = backend.open_reader(pid)?;

    let workers = worker_count();
    tracing::debug!(workers, "starting key search");

    // Fires on the first validated key, a worker-side failure, or the
    // caller's token; everything blocked on a channel observes it.
    let scan_cancel = CancelToken::new();
    let (buf_tx, buf_rx) = bounded::<RegionBuffer>(REGION_CHANNEL_CAPACITY);
    let (result_tx, result_rx) = bounded::<ExtractResult<KeyFinding>>(1);

    enum Wait {
        Settled(ExtractResult<KeyFinding>),
        Drained,
        CallerCancelled,
    }

    let (wait, report) = thread::scope(|s| {
        let reader: &dyn RegionReader = &*reader;
        let validator = &validator;
        let scan_cancel = &scan_cancel;

        let producer = s.spawn(move || produce_regions(regions, reader, buf_tx, scan_cancel));

        for _ in 0..workers {
            let buf_rx = buf_rx.clone();
            let result_tx = result_tx.clone();
            s.spawn(move || scan_worker(&buf_rx, &result_tx, reader, validator, scan_cancel));
        }
        // Workers hold the only remaining endpoints: the result channel
        // disconnects exactly when the last worker exits.
        drop(buf_rx);
        drop(result_tx);

        let wait = select! {
            recv(result_rx) -> msg => match msg {
                Ok(settled) => Wait::Settled(settled),
                Err(_) => Wait::Drained,
            },
            recv(cancel.observe()) -> _ => Wait::CallerCancelled,
        };

        // Tear down whatever is still running before the scope joins it.
        scan_cancel.cancel();
        let report = producer.join().unwrap_or_else(|_| ProducerReport {
            regions_read: 0,
            first_error: Some(ExtractError::internal("producer thread panicked")),
        });
        (wait, report)
    });

    match wait {
        Wait::Settled(Ok(finding)) => {
            tracing::info!(
                address = format_args!("{:#x}", finding.address),
                region_start = format_args!("{:#x}", finding.region_start),
                strategy = ?finding.strategy,
                "recovered database key"
            );
            Ok(finding.key)
        }
        Wait::Settled(Err(err)) => Err(err),
        Wait::CallerCancelled => Err(ExtractError::Cancelled),
        Wait::Drained => {
            if report.regions_read == 0 {
                if let Some(err) = report.first_error {
                    return Err(err);
                }
            }
            Err(ExtractError::NoValidKey)
        }
    }
}

fn worker_count() -> usize {
    num_cpus::get().clamp(MIN_WORKERS, MAX_WORKERS)
}

struct ProducerReport {
    regions_read: usize,
    first_error: Option<ExtractError>,
}

/// Snapshot each region in order and hand the buffers to the workers.
///
/// Region-level faults are logged and skipped; the first one is kept so
/// the pipeline can surface it if nothing was ever readable.
fn produce_regions(
    regions: Vec<MemoryRegion>,
    reader: &dyn RegionReader,
    buf_tx: Sender<RegionBuffer>,
    cancel: &CancelToken,
) -> ProducerReport {
    let mut report = ProducerReport { regions_read: 0, first_error: None };

    for region in &regions {
        if cancel.is_cancelled() {
            break;
        }
        if region.size() > MAX_REGION_SIZE {
            tracing::warn!(
                start = format_args!("{:#x}", region.start),
                end = format_args!("{:#x}", region.end),
                class = ?region.class,
                size = region.size(),
                "skipping oversized region"
            );
            continue;
        }

        let buf = match reader.read_region(region) {
            Ok(buf) => buf,
            Err(err) => {
                tracing::warn!(
                    start = format_args!("{:#x}", region.start),
                    end = format_args!("{:#x}", region.end),
                    class = ?region.class,
                    %err,
                    "skipping unreadable region"
                );
                report.first_error.get_or_insert(err);
                continue;
            }
        };

        select! {
            send(buf_tx, buf) -> res => {
                if res.is_err() {
                    // Every worker is gone; someone already won.
                    break;
                }
                report.regions_read += 1;
            }
            recv(cancel.observe()) -> _ => break,
        }
    }

    report
}

/// Consume buffers until the channel drains or the scan is torn down.
fn scan_worker(
    buf_rx: &Receiver<RegionBuffer>,
    result_tx: &Sender<ExtractResult<KeyFinding>>,
    reader: &dyn RegionReader,
    validator: &Validator,
    cancel: &CancelToken,
) {
    loop {
        let buf = select! {
            recv(buf_rx) -> msg => match msg {
                Ok(buf) => buf,
                Err(_) => return,
            },
            recv(cancel.observe()) -> _ => return,
        };

        match sweep_buffer(&buf, reader, validator, cancel) {
            Ok(None) => {}
            Ok(Some(finding)) => {
                // A full slot means another worker won; either way this
                // worker is done.
                let _ = result_tx.try_send(Ok(finding));
                cancel.cancel();
                return;
            }
            Err(err) => {
                let _ = result_tx.try_send(Err(err));
                cancel.cancel();
                return;
            }
        }
    }
}

/// Run both scan strategies over one buffer.
///
/// The pointer chase is authoritative and always runs first; the offset
/// probe only runs if the chase validates nothing. Candidates are checked
/// in the buffer's back-to-front order and cancellation is observed
/// between every candidate.
fn sweep_buffer(
    buf: &RegionBuffer,
    reader: &dyn RegionReader,
    validator: &Validator,
    cancel: &CancelToken,
) -> ExtractResult<Option<KeyFinding>> {
    let mut scan = PointerScan::new(&buf.data);
    let mut batch: Vec<(usize, u64)> = Vec::with_capacity(CANDIDATE_BATCH);

    loop {
        batch.clear();
        while batch.len() < CANDIDATE_BATCH {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match scan.next() {
                Some(candidate) => batch.push(candidate),
                None => break,
            }
        }
        if batch.is_empty() {
            break;
        }

        for &(pos, ptr) in &batch {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let key = match resolve_candidate(buf, ptr, reader) {
                Some(key) => key,
                None => continue,
            };
            if validator.try_validate(&key)? {
                tracing::debug!(
                    offset = pos,
                    address = format_args!("{:#x}", ptr),
                    "candidate validated"
                );
                return Ok(Some(KeyFinding {
                    key: hex::encode(key),
                    address: ptr,
                    region_start: buf.start,
                    strategy: Strategy::PointerChase,
                }));
            }
        }
    }

    for (at, key) in OffsetProbe::new(&buf.data) {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if validator.try_validate(&key)? {
            let address = buf.start + at as u64;
            tracing::debug!(
                offset = at,
                address = format_args!("{:#x}", address),
                "fallback candidate validated"
            );
            return Ok(Some(KeyFinding {
                key: hex::encode(key),
                address,
                region_start: buf.start,
                strategy: Strategy::OffsetProbe,
            }));
        }
    }

    Ok(None)
}

/// The 32 bytes a candidate pointer refers to, from the buffer itself when
/// the pointer lands inside it, otherwise point-read from the target.
/// Unreadable candidates are discarded.
fn resolve_candidate(
    buf: &RegionBuffer,
    ptr: u64,
    reader: &dyn RegionReader,
) -> Option<[u8; KEY_SIZE]> {
    if let Some(key) = resolve_in_buffer(buf, ptr) {
        return Some(key);
    }
    match reader.point_read(ptr, KEY_SIZE) {
        Ok(bytes) => bytes.try_into().ok(),
        Err(err) => {
            tracing::debug!(address = format_args!("{:#x}", ptr), %err, "discarding candidate");
            None
        }
    }
}
