use cake::cli::{dispatch, Cli};
use clap::Parser;
use tempfile::tempdir;

fn run(args: &[&str]) {
    let cli = Cli::parse_from(std::iter::once("cake").chain(args.iter().copied()));
    dispatch(cli).unwrap();
}

fn db_path(dir: &tempfile::TempDir) -> String {
    dir.path().join("db.sqlite").to_str().unwrap().to_string()
}

#[test]
fn add_sixteen_tasks_then_status_reports_queued() {
    let dir = tempdir().unwrap();
    let db = db_path(&dir);

    for i in 0..16 {
        run(&["add", &db, &format!("echo {i}")]);
    }

    let store = cake_store::Store::open(&db, cake_store::StoreConfig::default()).unwrap();
    let report = store.status().unwrap();
    let queued = report
        .per_state
        .iter()
        .find(|(s, _)| *s == cake_store::TaskState::QUEUED_NO_DEP)
        .unwrap()
        .1;
    assert_eq!(queued, 16);
    store.close().unwrap();
}

#[test]
fn serial_run_drains_queue_to_succeeded() {
    let dir = tempdir().unwrap();
    let db = db_path(&dir);

    for i in 0..16 {
        run(&["add", &db, &format!("echo {i}")]);
    }
    run(&["run", &db, "--silent"]);

    let store = cake_store::Store::open(&db, cake_store::StoreConfig::default()).unwrap();
    let report = store.status().unwrap();
    let succeeded = report
        .per_state
        .iter()
        .find(|(s, _)| *s == cake_store::TaskState::SUCCEEDED)
        .unwrap()
        .1;
    assert_eq!(succeeded, 16);
    store.close().unwrap();
}

#[test]
fn local_pool_run_drains_queue_to_succeeded() {
    let dir = tempdir().unwrap();
    let db = db_path(&dir);

    for i in 0..16 {
        run(&["add", &db, &format!("echo {i}")]);
    }
    run(&["run", &db, "-n", "4", "--silent"]);

    let store = cake_store::Store::open(&db, cake_store::StoreConfig::default()).unwrap();
    let report = store.status().unwrap();
    let succeeded = report
        .per_state
        .iter()
        .find(|(s, _)| *s == cake_store::TaskState::SUCCEEDED)
        .unwrap()
        .1;
    assert_eq!(succeeded, 16);
    store.close().unwrap();
}

#[test]
fn delete_then_status_excludes_it_from_total() {
    let dir = tempdir().unwrap();
    let db = db_path(&dir);
    run(&["add", &db, "--task-id", "t1", "echo hi"]);
    run(&["delete", &db, "t1"]);

    let store = cake_store::Store::open(&db, cake_store::StoreConfig::default()).unwrap();
    let report = store.status().unwrap();
    assert_eq!(report.num_tasks, 0);
    store.close().unwrap();
}

#[test]
fn update_then_log_shows_diff_in_info() {
    let dir = tempdir().unwrap();
    let db = db_path(&dir);
    run(&["add", &db, "--task-id", "t1", "echo hi"]);
    run(&["update", &db, "t1", "--priority", "5"]);

    let store = cake_store::Store::open(&db, cake_store::StoreConfig::default()).unwrap();
    let (task, logs) = store.log("t1").unwrap();
    assert_eq!(task.priority, 5.0);
    assert!(logs.last().unwrap().info.contains("PRIORITY"));
    store.close().unwrap();
}

#[test]
fn reset_after_checkin_cycle_requeues_everything() {
    let dir = tempdir().unwrap();
    let db = db_path(&dir);
    let store = cake_store::Store::open(&db, cake_store::StoreConfig::default()).unwrap();

    let outcomes = [
        cake_store::TaskState::FAILED,
        cake_store::TaskState::SUCCEEDED,
        cake_store::TaskState::CHECKPOINTED,
        cake_store::TaskState::KILLED,
    ];
    for i in 0..10 {
        let id = format!("t{i}");
        store.add("echo hi", Some(id.clone()), None).unwrap();
        store.checkout(None).unwrap();
        store.checkin(&id, outcomes[i % outcomes.len()], "").unwrap();
    }
    store.close().unwrap();

    run(&["reset", &db]);

    let store = cake_store::Store::open(&db, cake_store::StoreConfig::default()).unwrap();
    for i in 0..10 {
        let id = format!("t{i}");
        let (task, logs) = store.log(&id).unwrap();
        assert_eq!(task.state, cake_store::TaskState::QUEUED_NO_DEP);
        assert_eq!(logs.last().unwrap().action, cake_store::LogAction::RESET);
    }
    store.close().unwrap();
}

#[test]
fn pause_then_state_reports_paused() {
    let dir = tempdir().unwrap();
    let db = db_path(&dir);
    run(&["add", &db, "echo hi"]);
    run(&["pause", &db]);

    let store = cake_store::Store::open(&db, cake_store::StoreConfig::default()).unwrap();
    assert_eq!(store.state().unwrap(), cake_store::StoreState::PAUSED);
    store.close().unwrap();
}
