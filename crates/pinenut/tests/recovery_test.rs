//! Crash recovery through the mapped buffer file.

mod testutil;

use std::time::Duration;

use pinenut::{Config, Domain, Level, Logger};
use testutil::{incompressible, parse_domain, record_at, segment_names, wait_until, FakeClock, T0};

#[test]
fn dropped_logger_loses_nothing_with_mmap() {
    let dir = tempfile::tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let clock = FakeClock::at(T0);

    let logger =
        Logger::with_clock(domain.clone(), Config::default(), clock.clone()).unwrap();
    for i in 0..1000 {
        logger
            .log(&record_at(clock.secs(), Level::Info, format!("buffered {i}")))
            .unwrap();
    }
    // Crash: no shutdown, no flush. The records only exist in the buffer.
    drop(logger);
    assert!(segment_names(&domain).is_empty());

    // Re-opening the domain replays the buffer into a segment.
    let mut reopened =
        Logger::with_clock(domain.clone(), Config::default(), clock).unwrap();
    reopened.shutdown().unwrap();

    let parsed = parse_domain(&domain, None);
    assert_eq!(parsed.len(), 1000);
    for (i, record) in parsed.iter().enumerate() {
        assert_eq!(record.content, format!("buffered {i}"));
    }
}

#[test]
fn recovery_continues_a_partially_drained_stream() {
    let dir = tempfile::tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let clock = FakeClock::at(T0);
    let config = Config {
        buffer_len: 8192,
        ..Config::default()
    };

    let logger = Logger::with_clock(domain.clone(), config.clone(), clock.clone()).unwrap();
    let contents: Vec<String> = (0..8).map(|i| incompressible(1500, 100 + i)).collect();
    for content in &contents {
        logger
            .log(&record_at(clock.secs(), Level::Info, content.clone()))
            .unwrap();
    }
    // At least one half has been handed to the worker; wait for the disk to
    // see it so the crash leaves a segment with a stream prefix behind.
    let drained = wait_until(Duration::from_secs(5), || {
        segment_names(&domain).first().map_or(false, |name| {
            std::fs::metadata(domain.directory.join(name)).map_or(false, |meta| meta.len() > 8)
        })
    });
    assert!(drained, "a full half reaches disk before the crash");
    drop(logger);

    let mut reopened = Logger::with_clock(domain.clone(), config, clock).unwrap();
    reopened.shutdown().unwrap();

    let parsed = parse_domain(&domain, None);
    assert_eq!(parsed.len(), contents.len());
    for (record, content) in parsed.iter().zip(&contents) {
        assert_eq!(&record.content, content);
    }
}

#[test]
fn an_in_memory_buffer_does_not_recover() {
    let dir = tempfile::tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let config = Config {
        use_mmap: false,
        ..Config::default()
    };

    let logger = Logger::new(domain.clone(), config.clone()).unwrap();
    logger
        .log(&record_at(T0, Level::Info, "volatile"))
        .unwrap();
    drop(logger);

    let mut reopened = Logger::new(domain.clone(), config).unwrap();
    reopened.shutdown().unwrap();
    assert!(segment_names(&domain).is_empty());
}

#[test]
fn a_buffer_size_change_discards_the_staged_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let domain = Domain::new("app", dir.path());

    let logger = Logger::new(domain.clone(), Config::default()).unwrap();
    logger
        .log(&record_at(T0, Level::Info, "from the old size"))
        .unwrap();
    drop(logger);

    let resized = Config {
        buffer_len: 655_360,
        ..Config::default()
    };
    let mut reopened = Logger::new(domain.clone(), resized).unwrap();
    reopened.shutdown().unwrap();
    assert!(segment_names(&domain).is_empty());
}

#[test]
fn recovery_is_idempotent_across_clean_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let clock = FakeClock::at(T0);

    let logger =
        Logger::with_clock(domain.clone(), Config::default(), clock.clone()).unwrap();
    logger
        .log(&record_at(clock.secs(), Level::Info, "once"))
        .unwrap();
    drop(logger);

    // First reopen recovers; the second must find a clean buffer and
    // recover nothing more.
    drop(Logger::with_clock(domain.clone(), Config::default(), clock.clone()).unwrap());
    let mut last = Logger::with_clock(domain.clone(), Config::default(), clock).unwrap();
    last.shutdown().unwrap();

    let parsed = parse_domain(&domain, None);
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].content, "once");
}
