//! Integration tests for process-mode buffers
//!
//! Kept in their own test binary, without a tracing subscriber, so that no
//! logging lock can be held by another thread when a worker is forked.

#![cfg(unix)]

use bgbuf_sync::{BackgroundBuffer, BufError, BufferConfig, Mode};
use serde::{Deserialize, Serialize};
use bgbuf_sync::Operation;
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Several tests below assert on timing. Run one at a time so other tests'
/// worker processes do not skew them.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{0}")]
struct ValueError(String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    id: u32,
    label: String,
}

fn process_config(capacity: usize) -> BufferConfig {
    BufferConfig::new(capacity).with_mode(Mode::Process)
}

/// A fresh file the worker process can report its pull count through.
fn pull_count_file() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("bgbuf-pulls-{}-{}", std::process::id(), nanos))
}

fn read_pull_count(path: &Path) -> usize {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

/// Test that a process worker delivers every value in order
#[test]
fn test_process_values_in_order() {
    let _guard = serial();

    let source = (0..50_u32).map(|id| {
        Ok::<_, ValueError>(Record {
            id,
            label: format!("record-{id}"),
        })
    });
    let mut buffer = BackgroundBuffer::spawn(source, process_config(2)).expect("Failed to spawn");
    assert_eq!(buffer.mode(), Mode::Process);
    assert!(buffer.worker_pid().is_some());

    for id in 0..50 {
        let record = buffer.pull().unwrap().expect("ended early");
        assert_eq!(record.id, id);
        assert_eq!(record.label, format!("record-{id}"));
    }
    assert_eq!(buffer.pull().unwrap(), None);
    assert_eq!(buffer.pull().unwrap(), None);
    buffer.close().expect("Failed to close");
}

/// Source yields "a", "b" then fails with "bad"; capacity 1
#[test]
fn test_process_failure_crosses_boundary() {
    let _guard = serial();

    let source = vec![
        Ok("a".to_string()),
        Ok("b".to_string()),
        Err(ValueError("bad".to_string())),
    ];
    let mut buffer = BackgroundBuffer::spawn(source, process_config(1)).unwrap();

    assert_eq!(buffer.pull().unwrap(), Some("a".to_string()));
    assert_eq!(buffer.pull().unwrap(), Some("b".to_string()));
    match buffer.pull() {
        Err(BufError::Source { error, .. }) => assert_eq!(error, ValueError("bad".to_string())),
        other => panic!("expected source failure, got {:?}", other),
    }
    assert_eq!(buffer.pull().unwrap(), None);
}

/// Test that a panic in the worker process is reported as a failure
#[test]
fn test_process_panic_is_reported() {
    let _guard = serial();

    let mut calls = 0_u32;
    let source = std::iter::from_fn(move || {
        calls += 1;
        if calls == 3 {
            panic!("worker process exploded");
        }
        Some(Ok::<_, ValueError>(calls))
    });
    let mut buffer = BackgroundBuffer::spawn_process(source, BufferConfig::new(2)).unwrap();

    assert_eq!(buffer.pull().unwrap(), Some(1));
    assert_eq!(buffer.pull().unwrap(), Some(2));
    match buffer.pull() {
        Err(BufError::Panicked { message, .. }) => {
            assert_eq!(message, "worker process exploded")
        }
        other => panic!("expected panic failure, got {:?}", other),
    }
    assert_eq!(buffer.pull().unwrap(), None);
}

/// Test that the source only needs to exist in the parent, not be `Send`
#[test]
fn test_process_source_need_not_be_send() {
    let _guard = serial();

    let next = Rc::new(Cell::new(0_u32));
    let source = std::iter::from_fn(move || {
        let value = next.get();
        next.set(value + 1);
        (value < 5).then_some(Ok::<_, ValueError>(value))
    });
    let buffer = BackgroundBuffer::spawn_process(source, BufferConfig::new(1)).unwrap();

    let values: Vec<u32> = buffer.collect::<Result<_, _>>().unwrap();
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
}

/// Test that a killed worker process surfaces as a lost worker exactly once
#[test]
fn test_killed_worker_is_lost() {
    let _guard = serial();

    let source = (0_u64..).map(|i| {
        thread::sleep(Duration::from_millis(5));
        Ok::<_, ValueError>(i)
    });
    let mut buffer = BackgroundBuffer::spawn(source, process_config(2)).unwrap();
    assert_eq!(buffer.pull().unwrap(), Some(0));

    let pid = buffer.worker_pid().expect("process mode has a pid") as libc::pid_t;
    // SAFETY: signals the worker process owned by `buffer`.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }

    let mut lost = 0;
    loop {
        match buffer.pull_timeout(Duration::from_secs(5)) {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(BufError::WorkerLost { .. }) => lost += 1,
            Err(other) => panic!("unexpected failure: {:?}", other),
        }
    }
    assert_eq!(lost, 1);
    assert_eq!(buffer.pull().unwrap(), None);
}

/// Test that cancel ends an infinite process source
#[test]
fn test_process_cancel() {
    let _guard = serial();

    let source = (0_u64..).map(Ok::<_, ValueError>);
    let mut buffer = BackgroundBuffer::spawn(source, process_config(2)).unwrap();
    assert_eq!(buffer.pull().unwrap(), Some(0));

    buffer.cancel();
    let start = Instant::now();
    while buffer.pull_timeout(Duration::from_secs(5)).unwrap().is_some() {
        assert!(start.elapsed() < Duration::from_secs(5));
    }
    assert!(buffer.is_exhausted());
    buffer.close().expect("Failed to close");
}

/// Test closing and dropping process buffers with work outstanding
#[test]
fn test_process_close_and_drop() {
    let _guard = serial();

    let buffer = BackgroundBuffer::spawn((0_u64..).map(Ok::<_, ValueError>), process_config(4))
        .unwrap();
    let start = Instant::now();
    buffer
        .close_timeout(Duration::from_secs(5))
        .expect("Failed to close");
    assert!(start.elapsed() < Duration::from_secs(5));

    let mut buffer =
        BackgroundBuffer::spawn((0_u64..).map(Ok::<_, ValueError>), process_config(1)).unwrap();
    assert_eq!(buffer.pull().unwrap(), Some(0));
    let start = Instant::now();
    drop(buffer);
    assert!(start.elapsed() < Duration::from_secs(5));
}

/// Test that a worker stuck in the source is killed by close_timeout
#[test]
fn test_process_close_timeout_kills_worker() {
    let _guard = serial();

    let source = std::iter::from_fn(|| {
        thread::sleep(Duration::from_secs(30));
        Some(Ok::<u32, ValueError>(0))
    });
    let buffer = BackgroundBuffer::spawn_process(source, BufferConfig::new(1)).unwrap();

    let start = Instant::now();
    match buffer.close_timeout(Duration::from_millis(100)) {
        Err(BufError::CloseFailed { message }) => assert!(message.contains("killed")),
        other => panic!("expected close failure, got {:?}", other),
    }
    assert!(start.elapsed() < Duration::from_secs(5));
}

/// Test that a worker process never runs more than `capacity` pulls ahead
#[test]
fn test_process_backpressure_window() {
    let _guard = serial();

    let capacity = 3;
    let path = pull_count_file();
    let counter = path.clone();
    let mut pulls = 0_usize;
    let source = std::iter::from_fn(move || {
        pulls += 1;
        if let Err(e) = fs::write(&counter, pulls.to_string()) {
            return Some(Err(ValueError(e.to_string())));
        }
        (pulls <= 20).then_some(Ok::<_, ValueError>(pulls))
    });
    let mut buffer = BackgroundBuffer::spawn(source, process_config(capacity)).unwrap();

    // Nobody has pulled yet: the worker fills the window and stops there.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(read_pull_count(&path), capacity);

    for consumed in 1..=20 {
        assert_eq!(buffer.pull().unwrap(), Some(consumed));
        thread::sleep(Duration::from_millis(10));
        let pulled = read_pull_count(&path);
        assert!(
            pulled <= consumed + capacity,
            "worker pulled {pulled} items with only {consumed} consumed"
        );
    }
    assert_eq!(buffer.pull().unwrap(), None);
    buffer.close().expect("Failed to close");
    let _ = fs::remove_file(&path);
}

/// Test that a consumer-side timeout leaves a process buffer usable
#[test]
fn test_process_get_timeout_is_not_terminal() {
    let _guard = serial();

    let source = (0..2_u32).map(|i| {
        thread::sleep(Duration::from_millis(300));
        Ok::<_, ValueError>(i)
    });
    let config = process_config(1).with_timeout(Duration::from_millis(30));
    let mut buffer = BackgroundBuffer::spawn(source, config).unwrap();

    match buffer.pull() {
        Err(err @ BufError::Timeout {
            operation: Operation::Get,
            ..
        }) => assert!(!err.is_terminal()),
        other => panic!("expected get timeout, got {:?}", other),
    }
    assert!(!buffer.is_exhausted());
    assert_eq!(buffer.pull_timeout(Duration::from_secs(5)).unwrap(), Some(0));
    assert_eq!(buffer.pull_timeout(Duration::from_secs(5)).unwrap(), Some(1));
    assert_eq!(buffer.pull_timeout(Duration::from_secs(5)).unwrap(), None);
}

/// Test that a worker process giving up on the consumer reports a put timeout
#[test]
fn test_process_put_timeout_is_reported() {
    let _guard = serial();

    let config = process_config(1).with_timeout(Duration::from_millis(50));
    let mut buffer = BackgroundBuffer::spawn((0_u64..).map(Ok::<_, ValueError>), config).unwrap();

    // Nobody pulls, so the worker never gets a second credit.
    thread::sleep(Duration::from_millis(300));

    assert_eq!(buffer.pull().unwrap(), Some(0));
    match buffer.pull() {
        Err(BufError::Timeout {
            operation: Operation::Put,
            after,
        }) => assert_eq!(after, Duration::from_millis(50)),
        other => panic!("expected put timeout, got {:?}", other),
    }
    assert_eq!(buffer.pull().unwrap(), None);
    assert_eq!(buffer.pull().unwrap(), None);
}

/// Test that workers spawned from several threads at once are each seen to
/// die by their own buffer
#[test]
fn test_concurrent_spawns_keep_streams_separate() {
    let _guard = serial();

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                let source = (0_u64..).map(|i| {
                    thread::sleep(Duration::from_millis(5));
                    Ok::<_, ValueError>(i)
                });
                let mut buffer = BackgroundBuffer::spawn(source, process_config(2)).unwrap();
                assert_eq!(buffer.pull().unwrap(), Some(0));

                let pid = buffer.worker_pid().expect("process mode has a pid") as libc::pid_t;
                // SAFETY: signals the worker process owned by `buffer`.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }

                let mut lost = 0;
                loop {
                    match buffer.pull_timeout(Duration::from_secs(5)) {
                        Ok(Some(_)) => continue,
                        Ok(None) => break,
                        Err(BufError::WorkerLost { .. }) => lost += 1,
                        Err(other) => panic!("unexpected failure: {:?}", other),
                    }
                }
                lost
            })
        })
        .collect();

    for consumer in consumers {
        assert_eq!(consumer.join().expect("consumer thread panicked"), 1);
    }
}
