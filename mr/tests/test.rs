use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mr::activity::{Activity, ActivityOutput};
use mr::config::{HostConfig, RetryPolicy};
use mr::host::{Host, RunHandle, RunOutcome};
use mr::resolver::InputResolver;
use mr::store::FsObjectStore;
use mr::worker::{ActivityWorker, Worker};
use mr::{ErrorKind, JobRequest, MrError, RunResult};

// key: line no, value: line content
fn read_input(dir: &Path) -> Vec<(String, String)> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut result = Vec::new();
    for file in files {
        let content = fs::read_to_string(file).unwrap();
        for line in content.lines() {
            result.push((result.len().to_string(), line.to_string()));
        }
    }
    result
}

fn map_function(_key: String, value: String) -> Vec<(String, String)> {
    value
        .split(|c: char| !(c.is_ascii_alphabetic() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| (w.to_lowercase(), "1".to_owned()))
        .collect()
}

fn reduce_function(key: String, values: Vec<String>) -> (String, String) {
    let mut count = 0;
    for item in values {
        count += item.parse::<u64>().unwrap();
    }
    (key, count.to_string())
}

/// Single-threaded word count to check the pipeline against.
fn sequential_counts(lines: Vec<(String, String)>) -> BTreeMap<String, u64> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in lines {
        for (word, one) in map_function(k, v) {
            grouped.entry(word).or_default().push(one);
        }
    }
    grouped
        .into_iter()
        .map(|(k, v)| {
            let (word, count) = reduce_function(k, v);
            (word, count.parse().unwrap())
        })
        .collect()
}

fn fast_config() -> HostConfig {
    HostConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
        },
        ..HostConfig::default()
    }
}

fn inline(lines: &[&str]) -> JobRequest {
    JobRequest::Inline {
        lines: lines.iter().map(|l| l.to_string()).collect(),
    }
}

async fn run_inline(lines: &[&str]) -> RunResult {
    let host = Host::new(Arc::new(Worker::without_store()), fast_config()).unwrap();
    match host.run("inline", inline(lines), RunHandle::new()).await {
        RunOutcome::Completed(result) => result,
        other => panic!("unexpected outcome {:?}", other),
    }
}

fn write_corpus(root: &Path) {
    let container = root.join("mrinputs");
    fs::create_dir_all(&container).unwrap();
    fs::write(
        container.join("1.txt"),
        "It was the best of times, it was the worst of times,\n\
         it was the age of wisdom, it was the age of foolishness,\n",
    )
    .unwrap();
    fs::write(
        container.join("2.txt"),
        "It's a truth universally acknowledged, that a single man\n\
         in possession of a good fortune must be in want of a wife.\n\
         42 !! ---\n",
    )
    .unwrap();
    let mut many = String::new();
    for i in 0..40 {
        many.push_str(&format!("{} ", "abcdefghijklmnopqrstuvwxyz".repeat(1 + i % 3)));
        many.push_str(&"z".repeat(i + 1));
        many.push('\n');
    }
    fs::write(container.join("3.txt"), many).unwrap();
}

fn fs_worker(root: &Path) -> Worker {
    let store = Arc::new(FsObjectStore::new(root));
    Worker::new(Arc::new(InputResolver::new(store, "mrinputs")))
}

/// Wraps a real worker: counts calls per activity and can inject faults.
struct Scripted {
    inner: Worker,
    maps: AtomicUsize,
    shuffles: AtomicUsize,
    reduces: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_first_map_attempts: usize,
    fatal_on_line: Option<String>,
    hang_on_shuffle: bool,
    map_delay: Duration,
}

impl Scripted {
    fn new(inner: Worker) -> Self {
        Scripted {
            inner,
            maps: AtomicUsize::new(0),
            shuffles: AtomicUsize::new(0),
            reduces: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_first_map_attempts: 0,
            fatal_on_line: None,
            hang_on_shuffle: false,
            map_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl ActivityWorker for Scripted {
    async fn execute(&self, activity: Activity) -> mr::Result<ActivityOutput> {
        match &activity {
            Activity::Map(record) => {
                let n = self.maps.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first_map_attempts {
                    return Err(MrError::transient("Mapper", "connection reset"));
                }
                if self.fatal_on_line.as_deref() == Some(record.line.as_str()) {
                    return Err(MrError::fatal("Mapper", "poisoned record"));
                }
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.map_delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Activity::Shuffle(_) => {
                self.shuffles.fetch_add(1, Ordering::SeqCst);
                if self.hang_on_shuffle {
                    futures::future::pending::<()>().await;
                }
            }
            Activity::Reduce(_) => {
                self.reduces.fetch_add(1, Ordering::SeqCst);
            }
            Activity::ResolveInput { .. } => {}
        }
        self.inner.execute(activity).await
    }
}

#[tokio::test]
async fn test_three_line_scenario() {
    let result = run_inline(&["the cat sat", "the dog sat", "The CAT ran"]).await;
    assert_eq!(result.input_count, 3);
    assert_eq!(result.unique_words, 5);
    assert_eq!(
        result.top_30,
        vec![
            ("the".to_string(), 3),
            ("cat".to_string(), 2),
            ("sat".to_string(), 2),
            ("dog".to_string(), 1),
            ("ran".to_string(), 1),
        ]
    );
    let expected: BTreeMap<String, u64> = [("the", 3), ("cat", 2), ("sat", 2), ("dog", 1), ("ran", 1)]
        .into_iter()
        .map(|(w, n)| (w.to_string(), n))
        .collect();
    assert_eq!(result.all_counts, expected);
}

#[tokio::test]
async fn test_zero_lines() {
    let result = run_inline(&[]).await;
    assert_eq!(result.input_count, 0);
    assert_eq!(result.unique_words, 0);
    assert!(result.top_30.is_empty());
    assert!(result.all_counts.is_empty());
}

#[tokio::test]
async fn test_punctuation_only_line_contributes_nothing() {
    let result = run_inline(&["42 !! ---", "hello"]).await;
    assert_eq!(result.input_count, 2);
    assert_eq!(result.all_counts.len(), 1);
    assert_eq!(result.all_counts.get("hello"), Some(&1));
}

#[tokio::test]
async fn test_store_run_matches_sequential_count() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let lines = read_input(&dir.path().join("mrinputs"));
    let expected = sequential_counts(lines.clone());

    let host = Host::new(Arc::new(fs_worker(dir.path())), fast_config()).unwrap();
    let request = JobRequest::from_json("{}").unwrap();
    let result = match host.run("store", request, RunHandle::new()).await {
        RunOutcome::Completed(result) => result,
        other => panic!("unexpected outcome {:?}", other),
    };

    assert_eq!(result.input_count, lines.len() as u64);
    assert_eq!(result.all_counts, expected);
    assert_eq!(result.unique_words, expected.len() as u64);

    let tokens: u64 = lines
        .iter()
        .map(|(k, v)| map_function(k.clone(), v.clone()).len() as u64)
        .sum();
    assert_eq!(result.all_counts.values().sum::<u64>(), tokens);

    let mut full: Vec<(String, u64)> = expected.into_iter().collect();
    full.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    assert!(full.len() > 30);
    assert_eq!(result.top_30.len(), 30);
    assert_eq!(result.top_30[..], full[..30]);
}

#[tokio::test]
async fn test_transient_map_failures_are_hidden() {
    let mut worker = Scripted::new(Worker::without_store());
    worker.fail_first_map_attempts = 2;
    let worker = Arc::new(worker);
    let host = Host::new(worker.clone(), fast_config()).unwrap();

    let outcome = host
        .run("retry", inline(&["a b", "b"]), RunHandle::new())
        .await;
    match outcome {
        RunOutcome::Completed(result) => assert_eq!(result.all_counts.get("b"), Some(&2)),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(worker.maps.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn test_fatal_mapper_fails_whole_run() {
    let mut worker = Scripted::new(Worker::without_store());
    worker.fatal_on_line = Some("bad line".to_string());
    let worker = Arc::new(worker);
    let host = Host::new(worker.clone(), fast_config()).unwrap();

    let outcome = host
        .run("fatal", inline(&["good", "bad line", "also good"]), RunHandle::new())
        .await;
    match outcome {
        RunOutcome::Failed(report) => {
            assert_eq!(report.kind, ErrorKind::FatalActivityError);
            assert!(report.message.contains("poisoned record"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    // the barrier failed, so nothing after it ran
    assert_eq!(worker.shuffles.load(Ordering::SeqCst), 0);
    assert_eq!(worker.reduces.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_object_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let host = Host::new(Arc::new(fs_worker(dir.path())), fast_config()).unwrap();
    let request =
        JobRequest::from_json(r#"{"container": "mrinputs", "blobs": ["1.txt", "gone.txt"]}"#).unwrap();

    match host.run("missing", request, RunHandle::new()).await {
        RunOutcome::Failed(report) => {
            assert_eq!(report.kind, ErrorKind::FatalActivityError);
            assert!(report.message.contains("gone.txt"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_in_flight_activities_are_capped() {
    let mut worker = Scripted::new(Worker::without_store());
    worker.map_delay = Duration::from_millis(5);
    let worker = Arc::new(worker);
    let config = HostConfig {
        max_in_flight: 2,
        ..fast_config()
    };
    let host = Host::new(worker.clone(), config).unwrap();
    let lines: Vec<String> = (0..12).map(|i| format!("line {}", i)).collect();
    let refs: Vec<&str> = lines.iter().map(|l| l.as_str()).collect();

    let outcome = host.run("capped", inline(&refs), RunHandle::new()).await;
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert!(worker.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(worker.maps.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn test_cancel_stops_run_at_next_barrier() {
    let mut worker = Scripted::new(Worker::without_store());
    worker.map_delay = Duration::from_millis(50);
    let worker = Arc::new(worker);
    let host = Arc::new(Host::new(worker.clone(), fast_config()).unwrap());
    let handle = RunHandle::new();

    let task = {
        let host = Arc::clone(&host);
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { host.run("cancel", inline(&["a", "b"]), handle).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.cancel();

    assert_eq!(task.await.unwrap(), RunOutcome::Cancelled);
    assert_eq!(worker.shuffles.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_crashed_run_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = HostConfig {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..fast_config()
    };
    let lines = ["the cat sat", "the dog sat", "The CAT ran"];

    // first host: mapping completes, then the process "dies" in the shuffle
    let mut first = Scripted::new(Worker::without_store());
    first.hang_on_shuffle = true;
    let first = Arc::new(first);
    let host = Arc::new(Host::new(first.clone(), config.clone()).unwrap());
    let handle = RunHandle::new();
    let task = {
        let host = Arc::clone(&host);
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { host.run("crashy", inline(&lines), handle).await })
    };
    for _ in 0..200 {
        if first.shuffles.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task.abort();
    assert_eq!(first.maps.load(Ordering::SeqCst), 3);

    // second host over the same checkpoint directory
    let second = Arc::new(Scripted::new(Worker::without_store()));
    let host = Host::new(second.clone(), config).unwrap();
    let unfinished = host.recover().unwrap();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].run_id(), "crashy");

    let outcome = host
        .resume(unfinished[0].clone(), RunHandle::new())
        .await;
    match outcome {
        RunOutcome::Completed(result) => {
            assert_eq!(result.unique_words, 5);
            assert_eq!(result.top_30[0], ("the".to_string(), 3));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(second.maps.load(Ordering::SeqCst), 0);
    assert_eq!(second.shuffles.load(Ordering::SeqCst), 1);
    assert_eq!(second.reduces.load(Ordering::SeqCst), 5);

    // finished runs are not offered for recovery again
    assert!(host.recover().unwrap().is_empty());
}
