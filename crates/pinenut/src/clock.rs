use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock instant as whole seconds plus a nanosecond remainder,
/// both relative to the Unix epoch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: i64,
    pub nsecs: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nsecs: u32) -> Self {
        Self { secs, nsecs }
    }

    /// Current time from the system clock.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nsecs: d.subsec_nanos(),
            },
            // Clock is before the epoch. Count backwards.
            Err(e) => Self {
                secs: -(e.duration().as_secs() as i64),
                nsecs: 0,
            },
        }
    }
}

/// Time source used by the engine for rotation and trimming decisions.
///
/// Production code uses [`SystemClock`]; tests substitute a fake so that
/// rotation boundaries can be crossed deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Identifier of the calling OS thread.
#[cfg(target_os = "linux")]
pub fn thread_id() -> u64 {
    // Safety: gettid has no preconditions and always succeeds.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
}

/// Identifier of the calling OS thread.
#[cfg(not(target_os = "linux"))]
pub fn thread_id() -> u64 {
    // Safety: pthread_self has no preconditions and always succeeds.
    (unsafe { libc::pthread_self() }) as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timestamp_is_ordered() {
        let a = Timestamp::new(10, 999_999_999);
        let b = Timestamp::new(11, 0);
        assert!(a < b);
    }

    #[test]
    fn thread_ids_differ_across_threads() {
        let here = thread_id();
        let there = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
