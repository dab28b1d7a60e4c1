use anyhow::Result;
use chrono::Utc;
use qs_agent::checkpoint::{FileRecord, OffsetStore};
use qs_agent::config::Config;
use qs_agent::runner::{self, AgentPipeline};
use qs_agent::scanner::{FileScanner, LocalDirScanner};
use qs_agent::{PipelineError, PipelineState};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

struct Env {
    _dir: TempDir,
    root: PathBuf,
    config: Config,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("logs");
        fs::create_dir_all(&root).unwrap();
        let db = dir.path().join("state").join("offsets.db");
        let today = Utc::now().date_naive();
        let raw = format!(
            r#"
            [source]
            root_dir = {root:?}

            [pipeline]
            file_type = "impala"
            scan_delay_ms = 600000
            start_date = "{today}"
            shutdown_timeout_ms = 5000

            [checkpoint]
            db_path = {db:?}

            [watcher]
            enabled = false
            "#
        );
        let config = Config::from_toml(&raw).unwrap();
        Self {
            _dir: dir,
            root,
            config,
        }
    }

    /// Directory of today's partition, created on demand.
    fn today_dir(&self) -> PathBuf {
        let scanner = LocalDirScanner::new(&self.root, "date=%Y-%m-%d", None).unwrap();
        let dir = scanner.dir_for_date(Utc::now().date_naive());
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn pipeline(&self) -> AgentPipeline {
        runner::build_pipeline(&self.config).unwrap()
    }
}

/// Ten 10-byte events.
fn hundred_bytes() -> String {
    (0..10).map(|n| format!("{{\"n\":1{n:02}}}\n")).collect()
}

fn records(pipeline: &AgentPipeline) -> Vec<FileRecord> {
    let store = pipeline.store();
    store
        .with_transaction(|tx| store.list_by_type(tx, "impala"))
        .unwrap()
}

fn journal_rows(pipeline: &AgentPipeline) -> i64 {
    let store = pipeline.store();
    store
        .with_transaction(|tx| {
            Ok(tx.query_row("SELECT COUNT(*) FROM query_events", [], |row| row.get(0))?)
        })
        .unwrap()
}

async fn wait_for(pipeline: &AgentPipeline, mut done: impl FnMut(&AgentPipeline) -> bool) {
    for _ in 0..100 {
        if done(pipeline) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached; records: {:?}", records(pipeline));
}

async fn stop(pipeline: &AgentPipeline) {
    pipeline.shutdown().unwrap();
    assert!(pipeline
        .await_termination(Duration::from_secs(5))
        .await
        .unwrap());
}

fn position_of(pipeline: &AgentPipeline, name: &str) -> Option<u64> {
    records(pipeline)
        .into_iter()
        .find(|r| r.file_path == Path::new(name))
        .map(|r| r.position)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_file_is_tracked_and_read_to_its_end() {
    let env = Env::new();
    let body = hundred_bytes();
    assert_eq!(body.len(), 100);
    fs::write(env.today_dir().join("a.log"), &body).unwrap();

    let pipeline = env.pipeline();
    pipeline.start().unwrap();
    wait_for(&pipeline, |p| position_of(p, "a.log") == Some(100)).await;
    stop(&pipeline).await;

    let stored = records(&pipeline);
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].finished);
    assert_eq!(stored[0].partition_date, Utc::now().date_naive());
    assert_eq!(journal_rows(&pipeline), 10);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_resumes_from_the_flushed_offset() {
    let env = Env::new();
    let path = env.today_dir().join("a.log");
    fs::write(&path, hundred_bytes()).unwrap();

    let first = env.pipeline();
    first.start().unwrap();
    wait_for(&first, |p| position_of(p, "a.log") == Some(100)).await;
    stop(&first).await;
    drop(first);

    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"{\"n\":110}\n{\"n\":111}\n").unwrap();

    let second = env.pipeline();
    second.start().unwrap();
    wait_for(&second, |p| position_of(p, "a.log") == Some(120)).await;
    stop(&second).await;

    assert_eq!(records(&second).len(), 1);
    assert_eq!(journal_rows(&second), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn final_event_marks_the_file_finished() {
    let env = Env::new();
    fs::write(
        env.today_dir().join("a.log"),
        "{\"n\":1}\n{\"n\":2,\"final\":true}\n",
    )
    .unwrap();

    let pipeline = env.pipeline();
    pipeline.start().unwrap();
    wait_for(&pipeline, |p| records(p).first().is_some_and(|r| r.finished)).await;
    stop(&pipeline).await;

    assert_eq!(position_of(&pipeline, "a.log"), Some(29));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_refresh_picks_up_new_files() {
    let env = Env::new();
    let dir = env.today_dir();

    let pipeline = env.pipeline();
    pipeline.start().unwrap();
    wait_for(&pipeline, |p| p.scan_dir().is_some()).await;
    assert_eq!(pipeline.scan_dir(), Some(dir.clone()));

    fs::write(dir.join("late.log"), hundred_bytes()).unwrap();
    // Early requests land inside the refresh throttle window and are dropped.
    wait_for(&pipeline, |p| {
        p.force_refresh();
        position_of(p, "late.log") == Some(100)
    })
    .await;
    assert_eq!(pipeline.active_count(), 1);
    stop(&pipeline).await;
}

#[tokio::test]
async fn lifecycle_misuse_is_rejected_without_side_effects() {
    let env = Env::new();
    let pipeline = env.pipeline();

    let err = pipeline.shutdown().unwrap_err();
    assert!(err.is_state_conflict());
    assert!(matches!(
        pipeline.await_termination(Duration::from_millis(10)).await,
        Err(PipelineError::InvalidState {
            expected: PipelineState::Stopped,
            actual: PipelineState::Init,
            ..
        })
    ));
    assert_eq!(pipeline.state(), PipelineState::Init);

    pipeline.start().unwrap();
    assert!(pipeline.start().unwrap_err().is_state_conflict());
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.shutdown().unwrap();
    assert!(pipeline.shutdown().unwrap_err().is_state_conflict());
    assert!(pipeline.start().unwrap_err().is_state_conflict());
    assert!(pipeline
        .await_termination(Duration::from_secs(5))
        .await
        .unwrap());
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn start_requires_a_runtime() {
    let env = Env::new();
    let pipeline = env.pipeline();
    assert!(matches!(pipeline.start(), Err(PipelineError::NoRuntime)));
    assert_eq!(pipeline.state(), PipelineState::Init);
}

#[tokio::test]
async fn force_refresh_before_start_is_ignored() {
    let env = Env::new();
    let pipeline = env.pipeline();
    pipeline.force_refresh();
    assert_eq!(pipeline.state(), PipelineState::Init);
    assert_eq!(pipeline.queue_size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_stops_the_pipeline_on_shutdown() -> Result<()> {
    let env = Env::new();
    fs::write(env.today_dir().join("a.log"), hundred_bytes())?;

    let pipeline = env.pipeline();
    pipeline.start()?;
    wait_for(&pipeline, |p| position_of(p, "a.log") == Some(100)).await;

    runner::drive(&pipeline, &env.config, async {}).await?;
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    Ok(())
}
