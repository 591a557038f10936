//! Statement execution and result shapes.

use super::*;
use rusqlite::types::Value;

fn seeded(dir: &TempDir) -> SessionManager {
    let manager = unlocked_with_notes(dir);
    for body in ["alpha", "beta", "gamma"] {
        manager
            .try_execute_with(
                "INSERT INTO notes (body) VALUES (?1)",
                vec![Value::Text(body.to_string())],
            )
            .unwrap();
    }
    manager
}

#[test]
fn rows_for_returns_matching_rows() {
    let dir = tempdir().unwrap();
    let manager = seeded(&dir);

    let rows = manager
        .rows_for(
            "SELECT id, body FROM notes WHERE body <> ?1 ORDER BY id",
            vec![Value::Text("beta".into())],
        )
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Integer(1), Value::Text("alpha".into())],
            vec![Value::Integer(3), Value::Text("gamma".into())],
        ]
    );
}

#[test]
fn rows_for_non_matching_predicate_is_empty() {
    let dir = tempdir().unwrap();
    let manager = seeded(&dir);
    let rows = manager
        .rows_for("SELECT * FROM notes WHERE id > ?1", vec![Value::Integer(100)])
        .unwrap();
    assert!(rows.is_empty());
}

#[test]
fn execute_with_reports_changed_rows() {
    let dir = tempdir().unwrap();
    let manager = seeded(&dir);
    let changed = manager.execute_with(
        "UPDATE notes SET body = body || ?1 WHERE id <= ?2",
        vec![Value::Text("!".into()), Value::Integer(2)],
    );
    assert_eq!(changed, 2);
    assert_eq!(
        note_bodies(&manager),
        vec!["alpha!".to_string(), "beta!".to_string(), "gamma".to_string()]
    );
}

#[test]
fn null_parameter_is_rejected_before_running() {
    let dir = tempdir().unwrap();
    let manager = seeded(&dir);
    match manager.try_execute_with(
        "INSERT INTO notes (id, body) VALUES (?1, ?2)",
        vec![Value::Integer(10), Value::Null],
    ) {
        Err(VaultError::InvalidParameter { index, .. }) => assert_eq!(index, 1),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(manager.count_for_table("notes").unwrap(), 3);
}

#[test]
fn scalar_runs_statements_without_result_columns() {
    let dir = tempdir().unwrap();
    let manager = unlocked_with_notes(&dir);

    assert_eq!(
        manager
            .scalar("INSERT INTO notes (body) VALUES ('written')", vec![])
            .unwrap(),
        None
    );
    assert_eq!(manager.count_for_table("notes").unwrap(), 1);

    assert_eq!(
        manager
            .count_for_sql("INSERT INTO notes (body) VALUES ('again')")
            .unwrap(),
        0
    );
    assert_eq!(
        note_bodies(&manager),
        vec!["written".to_string(), "again".to_string()]
    );
}

#[test]
fn scalar_forms() {
    let dir = tempdir().unwrap();
    let manager = seeded(&dir);

    assert_eq!(
        manager.scalar("SELECT count(*) FROM notes", vec![]).unwrap(),
        Some(Value::Integer(3))
    );
    assert_eq!(
        manager.scalar("SELECT body FROM notes WHERE id = 99", vec![]).unwrap(),
        None
    );
    assert_eq!(
        manager.scalar_text("SELECT max(id) FROM notes", vec![]).unwrap(),
        Some("3".to_string())
    );
    assert_eq!(
        manager
            .scalar_text("SELECT body FROM notes WHERE id = ?1", vec![Value::Integer(2)])
            .unwrap(),
        Some("beta".to_string())
    );

    manager.execute("CREATE TABLE files (data BLOB)");
    manager
        .try_execute_with(
            "INSERT INTO files (data) VALUES (?1)",
            vec![Value::Blob(vec![0xde, 0xad, 0xbe, 0xef])],
        )
        .unwrap();
    assert_eq!(
        manager.blob("SELECT data FROM files", vec![]).unwrap(),
        Some(vec![0xde, 0xad, 0xbe, 0xef])
    );
}

#[test]
fn counts() {
    let dir = tempdir().unwrap();
    let manager = seeded(&dir);
    assert_eq!(manager.count_for_table("notes").unwrap(), 3);
    assert_eq!(
        manager
            .count_for_sql("SELECT count(*) FROM notes WHERE body LIKE 'a%'")
            .unwrap(),
        1
    );
    // Empty result set counts as zero
    assert_eq!(
        manager
            .count_for_sql("SELECT id FROM notes WHERE id > 100")
            .unwrap(),
        0
    );

    manager.execute("CREATE TABLE \"odd name\" (x)");
    assert_eq!(manager.count_for_table("odd name").unwrap(), 0);
}

#[test]
fn statement_failure_carries_engine_code_and_notifies() {
    let dir = tempdir().unwrap();
    let (manager, observer) = observed_manager(&dir);
    manager.create(fast_key(PASSWORD)).unwrap();
    manager.execute("CREATE TABLE uniq (id INTEGER PRIMARY KEY)");
    manager.execute("INSERT INTO uniq VALUES (1)");
    observer.clear();

    let err = manager.try_execute("INSERT INTO uniq VALUES (1)").unwrap_err();
    match err.result_code() {
        Some(crate::ResultCode::Engine { primary, .. }) => assert_eq!(primary, 19),
        other => panic!("unexpected code: {other:?}"),
    }

    let events = observer.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], LifecycleEvent::DatabaseError(msg) if msg.contains("UNIQUE")));
}

#[test]
#[should_panic(expected = "statement failed")]
fn execute_panics_on_failure() {
    let dir = tempdir().unwrap();
    let manager = unlocked_with_notes(&dir);
    manager.execute("INSERT INTO missing_table VALUES (1)");
}

#[test]
fn for_each_row_streams_inside_queue() {
    let dir = tempdir().unwrap();
    let manager = seeded(&dir);

    let (visited, bodies) = manager
        .in_queue(|db| {
            let mut bodies = Vec::new();
            let visited = db.for_each_row("SELECT body FROM notes ORDER BY id", &[], |row| {
                bodies.push(row.get::<_, String>(0)?);
                Ok(())
            })?;
            Ok::<_, VaultError>((visited, bodies))
        })
        .unwrap()
        .unwrap();

    assert_eq!(visited, 3);
    assert_eq!(bodies, vec!["alpha", "beta", "gamma"]);
}

#[test]
fn for_each_row_stops_on_callback_error() {
    let dir = tempdir().unwrap();
    let manager = seeded(&dir);

    let result = manager
        .in_queue(|db| {
            db.for_each_row("SELECT body FROM notes", &[], |_| {
                Err(VaultError::command_failed("stop"))
            })
        })
        .unwrap();
    assert!(matches!(
        result,
        Err(VaultError::StatementFailed { code: crate::ResultCode::CommandFailed, .. })
    ));
}

#[test]
fn lifecycle_calls_from_row_callback_are_busy() {
    let dir = tempdir().unwrap();
    let manager = seeded(&dir);
    let inner = manager.clone();

    let outcome = manager
        .in_queue(move |db| {
            let mut seen = None;
            db.for_each_row("SELECT id FROM notes LIMIT 1", &[], |_| {
                seen = Some(inner.close());
                Ok(())
            })
            .map(|_| seen)
        })
        .unwrap()
        .unwrap();

    assert!(matches!(outcome, Some(Err(VaultError::Busy))));
    assert!(manager.is_unlocked());
}
