//! Double-buffered staging region.
//!
//! The region is one byte slab, either anonymous memory or a mapped file:
//! an 18-byte header followed by two equally sized halves. Loggers append
//! into the active half; the drain worker reads a vacated half and appends
//! it to the segment file. Header fields live in the slab itself so that a
//! process crash leaves the dirty flags and write offset on disk for the
//! next run to recover.
//!
//! Concurrency model: the `state` mutex serializes header mutation and
//! active-half writes. A vacated half is read by the drainer without that
//! lock; `swap` refuses to hand the same half out again (and blocks) until
//! [`DoubleBuffer::mark_clean`] retires the outstanding token.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};

use memmap2::MmapMut;

use crate::error::{Error, Result};

const MAGIC: [u8; 4] = *b"PNBF";
const VERSION: u16 = 1;

pub(crate) const HEADER_LEN: usize = 18;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_ACTIVE: usize = 6;
const OFF_DIRTY_A: usize = 7;
const OFF_DIRTY_B: usize = 8;
const OFF_WRITE_OFFSET: usize = 10;

/// Names a vacated half awaiting drain. Not Clone: draining a half twice
/// would duplicate its block in the segment file.
#[derive(Debug)]
pub(crate) struct HalfToken {
    index: usize,
    len: usize,
}

impl HalfToken {
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Outcome of [`DoubleBuffer::try_swap`].
pub(crate) enum TrySwap {
    /// The active half holds nothing; there is no work.
    Empty,
    /// The other half is still draining; try again later.
    Busy,
    /// The active half was vacated.
    Ready(HalfToken),
}

struct State {
    active: usize,
    write_offset: usize,
    dirty: [bool; 2],
    draining: Option<usize>,
}

enum Backing {
    // Leaked from a Box at construction, reclaimed in Drop. Kept raw so the
    // write pointer below is not derived from (and invalidated by moves of)
    // an owning Box.
    Memory(*mut [u8]),
    Mapped(#[allow(dead_code)] MmapMut),
}

pub(crate) struct DoubleBuffer {
    // Owns the allocation; accessed only through `ptr` after construction.
    backing: Backing,
    ptr: *mut u8,
    len: usize,
    half_capacity: usize,
    state: Mutex<State>,
    drained: Condvar,
}

// Safety: all writes to the slab happen under the `state` mutex and target
// either the header or the active half. The drainer's lock-free reads target
// a vacated half, which cannot become active again while its token is
// outstanding (`swap` waits on `drained`).
unsafe impl Send for DoubleBuffer {}
unsafe impl Sync for DoubleBuffer {}

fn round_to_page(len: u64) -> u64 {
    let page = page_size::get() as u64;
    (len + page - 1) / page * page
}

fn half_capacity_of(total: usize) -> Result<usize> {
    let usable = total
        .checked_sub(HEADER_LEN)
        .ok_or_else(|| Error::Config(format!("buffer of {total} bytes cannot hold its header")))?;
    let half = usable / 2;
    if half < 64 {
        return Err(Error::Config(format!(
            "buffer of {total} bytes leaves {half}-byte halves; too small to stage records"
        )));
    }
    Ok(half)
}

impl DoubleBuffer {
    /// An in-process buffer. No recovery: its contents die with the process.
    pub fn in_memory(buffer_len: u64) -> Result<DoubleBuffer> {
        let len = buffer_len as usize;
        let half_capacity = half_capacity_of(len)?;

        let slab = Box::into_raw(vec![0u8; len].into_boxed_slice());
        let ptr = slab as *mut u8;
        let buf = DoubleBuffer {
            backing: Backing::Memory(slab),
            ptr,
            len,
            half_capacity,
            state: Mutex::new(State {
                active: 0,
                write_offset: 0,
                dirty: [false, false],
                draining: None,
            }),
            drained: Condvar::new(),
        };
        buf.write_header_fresh();
        Ok(buf)
    }

    /// Opens (or creates) the mapped buffer file at `path`, sized to
    /// `buffer_len` rounded up to a page multiple.
    ///
    /// Returns the buffer plus any halves a previous run left dirty, oldest
    /// first. The caller replays them into the segment file and then calls
    /// [`DoubleBuffer::reset`]; until that reset the on-disk dirty flags
    /// stay set, so a crash during replay retries on the next open.
    pub fn open(path: &Path, buffer_len: u64) -> Result<(DoubleBuffer, Vec<Vec<u8>>)> {
        let rounded = round_to_page(buffer_len);
        let len = rounded as usize;
        let half_capacity = half_capacity_of(len)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let existing = file.metadata()?.len();
        let resized = existing != rounded;
        if resized {
            if existing != 0 {
                tracing::warn!(
                    path = %path.display(),
                    existing,
                    expected = rounded,
                    "buffer file size changed; discarding previous contents",
                );
            }
            file.set_len(rounded)?;
        }

        // Safety: the file is exclusively ours by the one-writer-per-domain
        // contract, and stays open (and thus sized) for the mapping's life.
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        let mut recovered = Vec::new();
        let mut header_ok = false;
        if !resized {
            header_ok = map[OFF_MAGIC..OFF_MAGIC + 4] == MAGIC
                && u16::from_le_bytes([map[OFF_VERSION], map[OFF_VERSION + 1]]) == VERSION;
            if !header_ok {
                tracing::warn!(
                    path = %path.display(),
                    "buffer file header is unrecognized; reinitializing",
                );
            }
        }

        let mut state = State {
            active: 0,
            write_offset: 0,
            dirty: [false, false],
            draining: None,
        };

        if header_ok {
            let active = (map[OFF_ACTIVE] == 1) as usize;
            let dirty = [map[OFF_DIRTY_A] != 0, map[OFF_DIRTY_B] != 0];
            let mut write_offset = u64::from_le_bytes(
                map[OFF_WRITE_OFFSET..OFF_WRITE_OFFSET + 8]
                    .try_into()
                    .expect("write_offset field is eight bytes"),
            ) as usize;
            write_offset = write_offset.min(half_capacity);

            // Oldest bytes first: a dirty inactive half predates the active
            // one. Its exact fill length was lost with the process, so the
            // whole half is replayed; the read path is prepared for trailing
            // garbage.
            for index in [1 - active, active] {
                if !dirty[index] {
                    continue;
                }
                let fill = if index == active {
                    write_offset
                } else {
                    half_capacity
                };
                if fill > 0 {
                    let start = HEADER_LEN + index * half_capacity;
                    recovered.push(map[start..start + fill].to_vec());
                }
            }
            state.active = active;
            state.write_offset = write_offset;
            state.dirty = dirty;
        }

        let ptr = map.as_mut_ptr();
        let buf = DoubleBuffer {
            backing: Backing::Mapped(map),
            ptr,
            len,
            half_capacity,
            state: Mutex::new(state),
            drained: Condvar::new(),
        };
        if !header_ok {
            buf.write_header_fresh();
        }
        Ok((buf, recovered))
    }

    pub fn half_capacity(&self) -> usize {
        self.half_capacity
    }

    /// Appends `bytes` to the active half, swapping first if they would not
    /// fit. A returned token names the vacated half the caller must drain.
    pub fn append(&self, bytes: &[u8]) -> Result<Option<HalfToken>> {
        if bytes.len() > self.half_capacity {
            return Err(Error::Config(format!(
                "staged write of {} bytes exceeds the {}-byte buffer half",
                bytes.len(),
                self.half_capacity
            )));
        }
        let mut state = self.lock_state();
        let mut token = None;
        if state.write_offset + bytes.len() > self.half_capacity {
            let (next, vacated) = self.swap_locked(state);
            state = next;
            token = vacated;
        }

        let at = HEADER_LEN + state.active * self.half_capacity + state.write_offset;
        self.put(at, bytes);
        state.write_offset += bytes.len();
        self.put(OFF_WRITE_OFFSET, &(state.write_offset as u64).to_le_bytes());
        let active = state.active;
        if !state.dirty[active] {
            state.dirty[active] = true;
            self.put_dirty(active, true);
        }
        Ok(token)
    }

    /// Vacates the active half even when not full. `None` if it is empty.
    pub fn swap(&self) -> Option<HalfToken> {
        let state = self.lock_state();
        let (_unused, token) = self.swap_locked(state);
        token
    }

    /// Non-blocking [`DoubleBuffer::swap`] for the drain worker, which must
    /// not wait on a drain only it can complete.
    pub fn try_swap(&self) -> TrySwap {
        let mut state = self.lock_state();
        if state.write_offset == 0 {
            return TrySwap::Empty;
        }
        if state.draining.is_some() {
            return TrySwap::Busy;
        }
        let old = state.active;
        let len = state.write_offset;
        state.active = 1 - old;
        state.write_offset = 0;
        state.draining = Some(old);
        self.put(OFF_ACTIVE, &[state.active as u8]);
        self.put(OFF_WRITE_OFFSET, &0u64.to_le_bytes());
        TrySwap::Ready(HalfToken { index: old, len })
    }

    /// Gives the drainer the vacated half's bytes without the state lock.
    pub fn with_half<R>(&self, token: &HalfToken, f: impl FnOnce(&[u8]) -> R) -> R {
        let start = HEADER_LEN + token.index * self.half_capacity;
        debug_assert!(start + token.len <= self.len);
        // Safety: `token` proves `state.draining == Some(token.index)`, so
        // writers cannot touch this half until mark_clean runs.
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.add(start), token.len) };
        f(bytes)
    }

    /// Retires a drained half once its bytes have been persisted.
    pub fn mark_clean(&self, token: HalfToken) {
        let mut state = self.lock_state();
        debug_assert_eq!(state.draining, Some(token.index));
        state.dirty[token.index] = false;
        self.put_dirty(token.index, false);
        state.draining = None;
        self.drained.notify_all();
    }

    /// Discards all staged state. Called once startup recovery has replayed
    /// whatever the previous run left behind.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.active = 0;
        state.write_offset = 0;
        state.dirty = [false, false];
        state.draining = None;
        self.write_header_fresh();
        self.drained.notify_all();
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("buffer state is never poisoned")
    }

    fn swap_locked<'a>(
        &self,
        mut state: MutexGuard<'a, State>,
    ) -> (MutexGuard<'a, State>, Option<HalfToken>) {
        if state.write_offset == 0 {
            return (state, None);
        }
        // Both halves are full: wait out the drain in progress.
        while state.draining.is_some() {
            state = self
                .drained
                .wait(state)
                .expect("buffer state is never poisoned");
        }
        let old = state.active;
        let len = state.write_offset;
        state.active = 1 - old;
        state.write_offset = 0;
        state.draining = Some(old);
        self.put(OFF_ACTIVE, &[state.active as u8]);
        self.put(OFF_WRITE_OFFSET, &0u64.to_le_bytes());

        (state, Some(HalfToken { index: old, len }))
    }

    fn write_header_fresh(&self) {
        self.put(OFF_MAGIC, &MAGIC);
        self.put(OFF_VERSION, &VERSION.to_le_bytes());
        self.put(OFF_ACTIVE, &[0]);
        self.put(OFF_DIRTY_A, &[0]);
        self.put(OFF_DIRTY_B, &[0, 0]); // dirty_B and the pad byte
        self.put(OFF_WRITE_OFFSET, &0u64.to_le_bytes());
    }

    fn put(&self, at: usize, bytes: &[u8]) {
        debug_assert!(at + bytes.len() <= self.len);
        // Safety: in bounds per the assert; callers hold the state lock (or
        // sole ownership during construction), so the region is unaliased.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(at), bytes.len()) }
    }

    fn put_dirty(&self, index: usize, dirty: bool) {
        let at = if index == 0 { OFF_DIRTY_A } else { OFF_DIRTY_B };
        self.put(at, &[dirty as u8]);
    }
}

impl Drop for DoubleBuffer {
    fn drop(&mut self) {
        if let Backing::Memory(slab) = self.backing {
            // Safety: produced by Box::into_raw in in_memory, dropped once.
            drop(unsafe { Box::from_raw(slab) });
        }
    }
}
