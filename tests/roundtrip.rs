//! End-to-end write/read cycles over a real store directory.

use aicf_core::{Record, RecordKind, Store, StoreConfig};
use similar_asserts::assert_eq;
use tempfile::tempdir;

fn open_store(dir: &tempfile::TempDir) -> Store {
    Store::open(dir.path(), StoreConfig::default()).unwrap()
}

#[test]
fn conversation_round_trips_with_contiguous_numbering() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let record = Record::new(RecordKind::Conversation, "c001")
        .with_metadata("timestamp", "2025-01-01T00:00:00Z")
        .with_metadata("messages", "3")
        .with_metadata("tokens", "150");
    let record_ref = store.write_conversation(record.clone()).unwrap();
    assert_eq!(record_ref.first_line, 1);

    let result = store.last(RecordKind::Conversation, 1).unwrap();
    assert_eq!(result.items.len(), 1);
    let read_back = &result.items[0];
    assert_eq!(read_back.id, "c001");
    assert_eq!(read_back.metadata, record.metadata);

    // Physical lines are numbered 1..N with no gaps: header, three
    // metadata lines, and the blank terminator.
    let raw = std::fs::read_to_string(dir.path().join("conversations.aicf")).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 5);
    for (i, line) in lines.iter().enumerate() {
        assert!(
            line.starts_with(&format!("{}|", i + 1)),
            "line {i} is misnumbered: {line:?}"
        );
    }
    assert_eq!(lines[0], "1|@CONVERSATION:c001");
}

#[test]
fn pipe_injection_is_escaped_and_parses_back() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    store
        .write_decision(
            Some("d001".into()),
            aicf_core::Decision {
                text: "pick a|b".into(),
                rationale: "because".into(),
                impact: aicf_core::Impact::High,
                confidence: "HIGH".into(),
            },
        )
        .unwrap();

    let raw = std::fs::read_to_string(dir.path().join("conversations.aicf")).unwrap();
    assert!(
        raw.contains("pick a\\x7cb|because|HIGH|HIGH"),
        "raw file: {raw}"
    );

    let result = store.last(RecordKind::Decisions, 1).unwrap();
    let decisions = result.items[0].decisions();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].text, "pick a|b");
}

#[test]
fn unknown_metadata_keys_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(&dir);
        let record = Record::new(RecordKind::Conversation, "c001")
            .with_metadata("timestamp", "2025-01-01T00:00:00Z")
            .with_metadata("x_downstream_marker", "kept verbatim");
        store.write_conversation(record).unwrap();
    }
    let store = open_store(&dir);
    let result = store.last(RecordKind::Conversation, 1).unwrap();
    assert_eq!(
        result.items[0]
            .metadata
            .get("x_downstream_marker")
            .map(String::as_str),
        Some("kept verbatim")
    );
}

#[test]
fn appends_never_mutate_existing_lines() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    store
        .write_conversation(
            Record::new(RecordKind::Conversation, "c001")
                .with_metadata("timestamp", "2025-01-01T00:00:00Z"),
        )
        .unwrap();
    let before = std::fs::read_to_string(dir.path().join("conversations.aicf")).unwrap();

    store
        .write_conversation(
            Record::new(RecordKind::Conversation, "c002")
                .with_metadata("timestamp", "2025-01-02T00:00:00Z"),
        )
        .unwrap();
    let after = std::fs::read_to_string(dir.path().join("conversations.aicf")).unwrap();

    assert!(after.starts_with(&before), "existing lines changed");
    assert!(after.len() > before.len());
}

#[test]
fn duplicate_ids_rejected_across_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(&dir);
        store
            .write_conversation(Record::new(RecordKind::Conversation, "c001"))
            .unwrap();
    }
    let store = open_store(&dir);
    let err = store
        .write_conversation(Record::new(RecordKind::Conversation, "c001"))
        .unwrap_err();
    assert!(matches!(err, aicf_core::Error::DuplicateId { .. }));
}
