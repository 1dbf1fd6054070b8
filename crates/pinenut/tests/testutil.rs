//! Shared fixtures for the end-to-end tests.

// Each integration test binary links this file and uses its own subset.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pinenut::{
    extract, parse_to_file, Clock, DefaultFormatter, Domain, Formatter, Level, Record, Timestamp,
};

/// Deterministic time source the tests advance by hand.
pub struct FakeClock(AtomicI64);

impl FakeClock {
    pub fn at(secs: i64) -> Arc<FakeClock> {
        Arc::new(FakeClock(AtomicI64::new(secs)))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn secs(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.secs(), 0)
    }
}

// 2024-01-02 03:04:00 UTC, a minute-bucket boundary.
pub const T0: i64 = 1_704_164_640;

pub fn record_at(secs: i64, level: Level, content: impl Into<String>) -> Record {
    Record::new(level, content).with_datetime(Timestamp::new(secs, 0))
}

/// Collects parsed records instead of rendering them, so tests can compare
/// whole [`Record`] values.
#[derive(Default)]
pub struct CollectFormatter {
    pub records: Vec<Record>,
    pub errors: Vec<String>,
}

impl Formatter for CollectFormatter {
    fn format(&mut self, record: &Record) -> Vec<u8> {
        self.records.push(record.clone());
        Vec::new()
    }

    fn unreadable(&mut self, error: &pinenut::Error) -> Option<Vec<u8>> {
        self.errors.push(error.to_string());
        None
    }
}

/// Extracts the domain's full history and parses it back into records.
pub fn parse_domain(domain: &Domain, secret: Option<&str>) -> Vec<Record> {
    let archive = domain.directory.join("archive.extract");
    extract(domain, i64::MIN, i64::MAX, &archive).expect("extract succeeds");
    parse_archive(&archive, secret)
}

pub fn parse_archive(archive: &Path, secret: Option<&str>) -> Vec<Record> {
    let dest = archive.with_extension("parsed");
    let mut formatter = CollectFormatter::default();
    parse_to_file(archive, &dest, secret, &mut formatter).expect("parse succeeds");
    formatter.records
}

/// Extracts the domain's full history and renders it with the default
/// formatter, returning one string per line.
pub fn parse_domain_lines(domain: &Domain, secret: Option<&str>) -> Vec<String> {
    let archive = domain.directory.join("archive.extract");
    extract(domain, i64::MIN, i64::MAX, &archive).expect("extract succeeds");
    let dest = archive.with_extension("txt");
    parse_to_file(&archive, &dest, secret, &mut DefaultFormatter).expect("parse succeeds");
    let text = std::fs::read_to_string(&dest).expect("rendered output is UTF-8");
    text.lines().map(str::to_string).collect()
}

/// Names of the domain's segment files, sorted.
pub fn segment_names(domain: &Domain) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(&domain.directory)
        .expect("domain directory exists")
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".pine"))
        .collect();
    names.sort();
    names
}

/// Polls `condition` until it holds or the timeout lapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Content that zstd cannot squeeze much, for exercising buffer overflow.
pub fn incompressible(len: usize, seed: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ALPHABET[(state >> 33) as usize % ALPHABET.len()] as char
        })
        .collect()
}
