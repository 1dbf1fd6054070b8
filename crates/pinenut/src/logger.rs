//! The public logging surface and its drain worker.
//!
//! `log` runs the whole record pipeline on the caller thread: encode the
//! frame, push it through the segment's compression and cipher sessions, and
//! stage the produced ciphertext in the double buffer. The only caller-side
//! suspension points are the pipeline mutex and, when a half fills, the
//! buffer swap. All file IO happens on one background worker thread fed
//! through a task channel.
//!
//! Sessions are bound to time buckets. When `log` observes a new bucket it
//! terminates the compression and cipher streams into the outgoing half,
//! vacates it tagged with the old bucket, and begins fresh sessions; the
//! drain worker then rotates segment files when the tagged bucket changes.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::{DoubleBuffer, HalfToken, TrySwap};
use crate::cipher::{self, CipherSession};
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::compress::CompressSession;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::segment::{FileEngine, Rotation, SegmentHeader};

/// Scopes one logical log stream: its identifier names files, the directory
/// holds them. One live [`Logger`] per domain.
#[derive(Clone, Debug)]
pub struct Domain {
    pub identifier: String,
    pub directory: PathBuf,
}

impl Domain {
    pub fn new(identifier: impl Into<String>, directory: impl Into<PathBuf>) -> Domain {
        Domain {
            identifier: identifier.into(),
            directory: directory.into(),
        }
    }

    pub(crate) fn buffer_path(&self) -> PathBuf {
        self.directory.join(format!("{}.buffer", self.identifier))
    }
}

/// Engine configuration. All fields have serviceable defaults, so host
/// applications typically deserialize a partial document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stage records in a mapped buffer file that survives process crashes.
    pub use_mmap: bool,
    /// Total staging buffer size in bytes. Rounded up to a page multiple
    /// when mapped; each half holds a bit less than half of it.
    pub buffer_len: u64,
    /// Width of the time bucket covered by one segment file.
    pub rotation: Rotation,
    /// Base64 secp256r1 public key. Set it to encrypt segments.
    pub key_str: Option<String>,
    /// zstd compression level.
    pub compression_level: i32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            use_mmap: true,
            buffer_len: 327_680,
            rotation: Rotation::default(),
            key_str: None,
            compression_level: 10,
        }
    }
}

lazy_static::lazy_static! {
    static ref OPEN_DOMAINS: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());
}

/// Registration of a domain directory, released on drop. Guards against two
/// loggers corrupting one directory from within the same process; a second
/// process is out of scope (there is no lock file).
struct DomainGuard {
    key: PathBuf,
}

fn acquire_domain(directory: &Path) -> Result<DomainGuard> {
    let key = directory
        .canonicalize()
        .unwrap_or_else(|_| directory.to_path_buf());
    let mut open = OPEN_DOMAINS
        .lock()
        .expect("domain registry is never poisoned");
    if !open.insert(key.clone()) {
        return Err(Error::State(
            "domain directory already has an open logger in this process",
        ));
    }
    Ok(DomainGuard { key })
}

impl Drop for DomainGuard {
    fn drop(&mut self) {
        let mut open = OPEN_DOMAINS
            .lock()
            .expect("domain registry is never poisoned");
        open.remove(&self.key);
    }
}

enum Task {
    Drain(DrainRequest),
    Flush,
    Trim(u64),
    Shutdown,
}

/// One vacated buffer half on its way to the segment for `bucket`.
struct DrainRequest {
    token: HalfToken,
    bucket: i64,
    header: Arc<Vec<u8>>,
    first_of_session: bool,
}

/// Compression and cipher state for the segment currently written to.
struct Session {
    bucket: i64,
    compressor: CompressSession,
    cipher: CipherSession,
    header: Arc<Vec<u8>>,
    header_sent: bool,
}

impl Session {
    fn request(&mut self, token: HalfToken) -> DrainRequest {
        let first_of_session = !self.header_sent;
        self.header_sent = true;
        DrainRequest {
            token,
            bucket: self.bucket,
            header: self.header.clone(),
            first_of_session,
        }
    }
}

/// Caller-path state guarded by one mutex: the active session plus scratch
/// buffers reused across records.
struct Pipeline {
    session: Option<Session>,
    scratch: Vec<u8>,
    frame: Vec<u8>,
    compressed: Vec<u8>,
    staged: Vec<u8>,
}

impl Pipeline {
    fn new() -> Pipeline {
        Pipeline {
            session: None,
            scratch: Vec::new(),
            frame: Vec::new(),
            compressed: Vec::new(),
            staged: Vec::new(),
        }
    }

    fn begin_session(
        &mut self,
        config: &Config,
        public_key: Option<&p256::PublicKey>,
        bucket: i64,
    ) -> Result<()> {
        let compressor = CompressSession::begin(config.compression_level)?;
        let (cipher, eph_public) = CipherSession::begin(public_key);
        let header = SegmentHeader { eph_public }.encode();
        self.session = Some(Session {
            bucket,
            compressor,
            cipher,
            header: Arc::new(header),
            header_sent: false,
        });
        Ok(())
    }

    /// Terminates the current session's streams. Their trailing bytes are
    /// staged into the buffer and the half is vacated so the closing segment
    /// receives everything it is owed.
    ///
    /// Drain requests are handed to the worker the moment a half vacates;
    /// the trailing swap below may have to wait out an earlier drain, which
    /// only completes if the worker already holds its request.
    fn end_session(&mut self, shared: &Shared) -> Result<()> {
        let session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };
        self.compressed.clear();
        self.staged.clear();
        let Session {
            bucket,
            compressor,
            mut cipher,
            header,
            mut header_sent,
        } = session;
        compressor.end(&mut self.compressed)?;
        cipher.write(&self.compressed, &mut self.staged);
        cipher.end(&mut self.staged);

        let mut send = |token: HalfToken| {
            let first_of_session = !header_sent;
            header_sent = true;
            shared.send_drain(DrainRequest {
                token,
                bucket,
                header: header.clone(),
                first_of_session,
            });
        };
        if !self.staged.is_empty() {
            if let Some(token) = shared.buffer.append(&self.staged)? {
                send(token);
            }
        }
        if let Some(token) = shared.buffer.swap() {
            send(token);
        }
        Ok(())
    }

    /// Pushes one encoded record through the session into the buffer.
    fn log_record(&mut self, record: &Record, shared: &Shared) -> Result<()> {
        self.frame.clear();
        codec::encode_record(record, &mut self.scratch, &mut self.frame);

        // Compression cannot grow input by more than frame and block
        // headers (under 64 bytes here), so an early size check keeps
        // impossible records out of the stream; rejecting after the
        // compressor saw the frame would corrupt it.
        if self.frame.len() + 64 > shared.buffer.half_capacity() {
            return Err(Error::Config(format!(
                "a {}-byte record frame cannot fit a buffer half of {} bytes",
                self.frame.len(),
                shared.buffer.half_capacity()
            )));
        }
        self.compressed.clear();
        self.staged.clear();

        let session = self.session.as_mut().expect("caller begins the session");
        session.compressor.write(&self.frame, &mut self.compressed)?;
        session.cipher.write(&self.compressed, &mut self.staged);

        if self.staged.is_empty() {
            return Ok(());
        }
        if let Some(token) = shared.buffer.append(&self.staged)? {
            shared.send_drain(session.request(token));
        }
        Ok(())
    }
}

struct Shared {
    config: Config,
    clock: Arc<dyn Clock>,
    public_key: Option<p256::PublicKey>,
    buffer: DoubleBuffer,
    pipeline: Mutex<Pipeline>,
    tx: Mutex<Option<Sender<Task>>>,
    closed: AtomicBool,
}

impl Shared {
    fn send(&self, task: Task) -> Result<()> {
        let tx = self.tx.lock().expect("task sender is never poisoned");
        match tx.as_ref() {
            Some(tx) => tx
                .send(task)
                .map_err(|_| Error::State("drain worker has exited")),
            None => Err(Error::State("logger is shut down")),
        }
    }

    fn send_drain(&self, request: DrainRequest) {
        if let Err(error) = self.send(Task::Drain(request)) {
            // The worker is gone; staged bytes stay in the buffer for the
            // next run to recover.
            tracing::error!(%error, "could not hand a drained half to the worker");
        }
    }
}

/// The engine's public surface. See the crate docs for the data flow.
pub struct Logger {
    domain: Domain,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    guard: Option<DomainGuard>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("domain", &self.domain).finish_non_exhaustive()
    }
}

impl Logger {
    /// Opens the domain directory, recovers any staged data a previous run
    /// left behind, and spawns the drain worker.
    pub fn new(domain: Domain, config: Config) -> Result<Logger> {
        Logger::with_clock(domain, config, Arc::new(SystemClock))
    }

    /// [`Logger::new`] with an injected time source. Rotation, trimming and
    /// recovery decisions all follow this clock.
    pub fn with_clock(domain: Domain, config: Config, clock: Arc<dyn Clock>) -> Result<Logger> {
        let public_key = match config.key_str.as_deref() {
            Some(key_str) => Some(cipher::parse_public_key(key_str)?),
            None => None,
        };
        fs::create_dir_all(&domain.directory)?;
        let guard = acquire_domain(&domain.directory)?;

        let (buffer, recovered) = if config.use_mmap {
            DoubleBuffer::open(&domain.buffer_path(), config.buffer_len)?
        } else {
            (DoubleBuffer::in_memory(config.buffer_len)?, Vec::new())
        };

        let mut engine = FileEngine::new(
            domain.directory.clone(),
            domain.identifier.clone(),
            config.rotation,
        );
        if !recovered.is_empty() {
            let bucket = config.rotation.bucket_start(clock.now().secs);
            let (_, eph_public) = CipherSession::begin(public_key.as_ref());
            let fallback = SegmentHeader { eph_public }.encode();
            tracing::info!(
                halves = recovered.len(),
                bytes = recovered.iter().map(Vec::len).sum::<usize>(),
                identifier = %domain.identifier,
                "recovering staged log data from a previous run",
            );
            for block in &recovered {
                if let Err(error) = engine.append_recovered(bucket, &fallback, block) {
                    tracing::error!(%error, "failed to replay a recovered buffer half");
                }
            }
            engine.finalize();
        }
        buffer.reset();

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            config,
            clock,
            public_key,
            buffer,
            pipeline: Mutex::new(Pipeline::new()),
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });

        let worker = std::thread::Builder::new()
            .name(format!("pinenut-drain-{}", domain.identifier))
            .spawn({
                let shared = shared.clone();
                move || worker_loop(&shared, rx, engine)
            })?;

        Ok(Logger {
            domain,
            shared,
            worker: Some(worker),
            guard: Some(guard),
        })
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Accepts one record. Encoding, compression and encryption run here on
    /// the caller thread; file IO does not.
    pub fn log(&self, record: &Record) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::State("logger is shut down"));
        }
        let bucket = self
            .shared
            .config
            .rotation
            .bucket_start(self.shared.clock.now().secs);

        let mut pipeline = self
            .shared
            .pipeline
            .lock()
            .expect("pipeline is never poisoned");
        let stale = pipeline
            .session
            .as_ref()
            .map_or(false, |s| s.bucket != bucket);
        if stale {
            pipeline.end_session(&self.shared)?;
        }
        if pipeline.session.is_none() {
            pipeline.begin_session(&self.shared.config, self.shared.public_key.as_ref(), bucket)?;
        }
        pipeline.log_record(record, &self.shared)
    }

    /// Asks the worker to drain the active half even if it is not full.
    /// Returns as soon as the request is queued.
    pub fn flush(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::State("logger is shut down"));
        }
        self.shared.send(Task::Flush)
    }

    /// Asks the worker to delete segments older than `lifetime_secs`.
    pub fn trim(&self, lifetime_secs: u64) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::State("logger is shut down"));
        }
        self.shared.send(Task::Trim(lifetime_secs))
    }

    /// Synchronously drains both halves, finalizes the open segment and
    /// stops the worker. The logger accepts no records afterwards.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::State("logger is shut down"));
        }
        let result = {
            let mut pipeline = self
                .shared
                .pipeline
                .lock()
                .expect("pipeline is never poisoned");
            pipeline.end_session(&self.shared)
        };
        if let Err(error) = &result {
            tracing::error!(%error, "failed to terminate the segment streams cleanly");
        }

        let _ = self.shared.send(Task::Shutdown);
        *self
            .shared
            .tx
            .lock()
            .expect("task sender is never poisoned") = None;
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| Error::Panic("drain worker panicked".to_string()))?;
        }
        self.guard.take();
        result
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        // No draining here: a logger dropped without shutdown models a
        // crash, and the staged bytes must survive for recovery. Closing
        // the channel lets the worker finish queued work and exit.
        *self
            .shared
            .tx
            .lock()
            .expect("task sender is never poisoned") = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared, rx: Receiver<Task>, mut engine: FileEngine) {
    let mut pending_drain: Option<DrainRequest> = None;
    let mut pending_flush = false;
    let mut graceful = false;

    loop {
        // Work deferred by an earlier failure or lock contention goes first,
        // so blocks keep their order in the segment file.
        if let Some(request) = pending_drain.take() {
            pending_drain = drain(shared, &mut engine, request);
        }
        if pending_flush && pending_drain.is_none() {
            let (done, failed) = try_flush(shared, &mut engine);
            pending_flush = !done;
            pending_drain = failed;
        }

        let task = if pending_drain.is_some() || pending_flush {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(task) => Some(task),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(task) => Some(task),
                Err(_) => break,
            }
        };

        match task {
            Some(Task::Drain(request)) => {
                debug_assert!(
                    pending_drain.is_none(),
                    "a half cannot vacate while another is still draining"
                );
                pending_drain = drain(shared, &mut engine, request);
            }
            Some(Task::Flush) => pending_flush = true,
            Some(Task::Trim(lifetime_secs)) => {
                let now = shared.clock.now();
                if let Err(error) = engine.trim(now.secs, lifetime_secs) {
                    tracing::error!(%error, "trim failed");
                }
            }
            Some(Task::Shutdown) => {
                graceful = true;
                break;
            }
            None => (),
        }
    }

    if graceful {
        if let Some(request) = pending_drain.take() {
            if drain(shared, &mut engine, request).is_some() {
                tracing::error!("dropping a buffer half that could not be persisted at shutdown");
            }
        }
        if pending_flush {
            let _ = try_flush(shared, &mut engine);
        }
        engine.finalize();
    }
}

/// Appends one vacated half to its segment. On failure the request is
/// returned for retry: the bytes stay staged, the caller-visible contract of
/// `log` is unaffected, and the half is only retired once persisted.
fn drain(
    shared: &Shared,
    engine: &mut FileEngine,
    request: DrainRequest,
) -> Option<DrainRequest> {
    let result = shared.buffer.with_half(&request.token, |bytes| {
        engine.append_block(
            request.bucket,
            &request.header,
            request.first_of_session,
            bytes,
        )
    });
    match result {
        Ok(()) => {
            shared.buffer.mark_clean(request.token);
            None
        }
        Err(error) => {
            tracing::error!(%error, bytes = request.token.len(), "drain failed; will retry");
            Some(request)
        }
    }
}

/// Attempts the swap a `flush` asked for. The first result is false when
/// the flush must be retried (pipeline lock contended, or a previous drain
/// still in flight); the second carries a drain that failed and must be
/// retried through the pending-drain slot.
fn try_flush(shared: &Shared, engine: &mut FileEngine) -> (bool, Option<DrainRequest>) {
    let mut pipeline = match shared.pipeline.try_lock() {
        Ok(pipeline) => pipeline,
        Err(_) => return (false, None),
    };
    let session = match pipeline.session.as_mut() {
        Some(session) => session,
        None => return (true, None),
    };
    match shared.buffer.try_swap() {
        TrySwap::Empty => (true, None),
        TrySwap::Busy => (false, None),
        TrySwap::Ready(token) => {
            let request = session.request(token);
            drop(pipeline);
            (true, drain(shared, engine, request))
        }
    }
}
