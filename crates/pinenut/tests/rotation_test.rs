//! Rotation, time-ranged extraction and trimming under a fake clock.

mod testutil;

use pinenut::{extract, Config, Domain, Level, Logger};
use testutil::{parse_archive, record_at, segment_names, FakeClock, T0};

#[test]
fn crossing_a_minute_boundary_rotates_the_segment() {
    let dir = tempfile::tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let clock = FakeClock::at(T0);
    let mut logger =
        Logger::with_clock(domain.clone(), Config::default(), clock.clone()).unwrap();

    logger
        .log(&record_at(clock.secs(), Level::Info, "first minute"))
        .unwrap();
    clock.advance(61);
    logger
        .log(&record_at(clock.secs(), Level::Info, "second minute"))
        .unwrap();
    logger.shutdown().unwrap();

    assert_eq!(
        segment_names(&domain),
        vec![
            "app_202401020304.pine".to_string(),
            "app_202401020305.pine".to_string(),
        ]
    );

    let parsed = testutil::parse_domain(&domain, None);
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].content, "first minute");
    assert_eq!(parsed[1].content, "second minute");
}

#[test]
fn extract_returns_the_buckets_intersecting_the_range() {
    let dir = tempfile::tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let clock = FakeClock::at(T0);
    let mut logger =
        Logger::with_clock(domain.clone(), Config::default(), clock.clone()).unwrap();

    // One record per second for 100 seconds, spanning two minute buckets.
    for i in 0..100 {
        logger
            .log(&record_at(clock.secs(), Level::Info, format!("second {i}")))
            .unwrap();
        clock.advance(1);
    }
    logger.shutdown().unwrap();
    assert_eq!(segment_names(&domain).len(), 2);

    // A range within the second bucket selects exactly that bucket's records.
    let slice = dir.path().join("slice.extract");
    extract(&domain, T0 + 60, T0 + 99, &slice).unwrap();
    let parsed = parse_archive(&slice, None);
    assert_eq!(parsed.len(), 40);
    for (record, i) in parsed.iter().zip(60..100) {
        assert_eq!(record.datetime.secs, T0 + i);
        assert_eq!(record.content, format!("second {i}"));
    }

    // The first bucket alone.
    extract(&domain, T0, T0 + 59, &slice).unwrap();
    let parsed = parse_archive(&slice, None);
    assert_eq!(parsed.len(), 60);
    assert_eq!(parsed[0].datetime.secs, T0);
    assert_eq!(parsed[59].datetime.secs, T0 + 59);

    // The full range reproduces everything, in order.
    extract(&domain, T0, T0 + 99, &slice).unwrap();
    assert_eq!(parse_archive(&slice, None).len(), 100);
}

#[test]
fn trim_deletes_expired_segments_but_never_the_open_one() {
    let dir = tempfile::tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let clock = FakeClock::at(T0);
    let mut logger =
        Logger::with_clock(domain.clone(), Config::default(), clock.clone()).unwrap();

    for _ in 0..3 {
        logger
            .log(&record_at(clock.secs(), Level::Info, "tick"))
            .unwrap();
        clock.advance(60);
    }
    // Clock is now T0+180; only the bucket ending at T0+60 falls before
    // now - lifetime = T0+90.
    // Queued ahead of the shutdown drain, so it has run once that returns.
    logger.trim(90).unwrap();
    logger.shutdown().unwrap();

    assert_eq!(
        segment_names(&domain),
        vec![
            "app_202401020305.pine".to_string(),
            "app_202401020306.pine".to_string(),
        ]
    );
}

#[test]
fn trim_zero_after_advancing_far_keeps_only_the_open_segment() {
    let dir = tempfile::tempdir().unwrap();
    let domain = Domain::new("app", dir.path());
    let clock = FakeClock::at(T0);
    let mut logger =
        Logger::with_clock(domain.clone(), Config::default(), clock.clone()).unwrap();

    logger
        .log(&record_at(clock.secs(), Level::Info, "old"))
        .unwrap();
    clock.advance(60);
    logger
        .log(&record_at(clock.secs(), Level::Info, "current"))
        .unwrap();
    // Flush so the second bucket becomes the open segment before trimming.
    logger.flush().unwrap();
    clock.advance(10_000);
    logger.trim(0).unwrap();
    logger.shutdown().unwrap();

    // The second bucket was the open segment when trim ran.
    assert_eq!(segment_names(&domain), vec!["app_202401020305.pine".to_string()]);
}
