//! Durable log format: fixture compatibility, reload round-trips, and
//! corruption handling.

use keel_raft::{Log, LogEntry, LogIndex, RaftError, Term};
use tempfile::TempDir;

/// Lines written by an independent implementation of the same format.
const FIXTURE: &str = concat!(
    "cf4aab23 0000000000000001 0000000000000001 cmd_1 {\"val\":\"foo\",\"i\":20}\n",
    "4c08d91f 0000000000000002 0000000000000001 cmd_2 {\"x\":100}\n",
    "6ac5807c 0000000000000003 0000000000000002 cmd_1 {\"val\":\"bar\",\"i\":0}\n",
);

#[test]
fn fixture_file_loads_and_replays_in_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    std::fs::write(&path, FIXTURE).unwrap();

    let mut replayed = Vec::new();
    let log = Log::open(&path, |entry| {
        replayed.push((entry.index, entry.term, entry.name.clone()))
    })
    .unwrap();

    assert_eq!(
        replayed,
        vec![
            (LogIndex(1), Term(1), "cmd_1".to_string()),
            (LogIndex(2), Term(1), "cmd_2".to_string()),
            (LogIndex(3), Term(2), "cmd_1".to_string()),
        ]
    );
    assert_eq!(log.last_info(), (LogIndex(3), Term(2)));
    assert_eq!(log.commit_info(), (LogIndex(3), Term(2)));
}

#[test]
fn loaded_entries_reencode_to_the_same_bytes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    std::fs::write(&path, FIXTURE).unwrap();

    let mut reencoded = String::new();
    Log::open(&path, |entry| {
        reencoded.push_str(&entry.encode().unwrap());
    })
    .unwrap();
    assert_eq!(reencoded, FIXTURE);
}

#[test]
fn appends_survive_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    {
        let mut log = Log::open(&path, |_| {}).unwrap();
        log.append(LogEntry::new(
            LogIndex(1),
            Term(1),
            "cmd_1",
            &b"{\"val\":\"foo\",\"i\":20}"[..],
        ))
        .unwrap();
        log.append(LogEntry::new(
            LogIndex(2),
            Term(1),
            "cmd_2",
            &b"{\"x\":100}"[..],
        ))
        .unwrap();
    }

    let mut count = 0;
    let log = Log::open(&path, |_| count += 1).unwrap();
    assert_eq!(count, 2);
    assert_eq!(log.last_info(), (LogIndex(2), Term(1)));
    assert_eq!(log.commit_info(), (LogIndex(2), Term(1)));
}

#[test]
fn flipped_byte_is_fatal_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let tampered = FIXTURE.replacen("100", "101", 1);
    std::fs::write(&path, tampered).unwrap();

    let err = Log::open(&path, |_| {}).unwrap_err();
    assert!(matches!(err, RaftError::Corrupt { line: 2, .. }));
}

#[test]
fn out_of_order_indexes_are_fatal_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");

    // Two copies of a valid line: checksums pass, ordering does not.
    let first = FIXTURE.lines().next().unwrap();
    std::fs::write(&path, format!("{first}\n{first}\n")).unwrap();

    let err = Log::open(&path, |_| {}).unwrap_err();
    assert!(matches!(err, RaftError::Corrupt { line: 2, .. }));
}
