// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the input manager against real files.
//!
//! Every test runs the full stack (scanner, watcher, prospector, harvester
//! coordinator, update writer) on a temporary directory and acknowledges
//! the published events from an in-process channel pipeline.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use logharvest::config::{Config, InputConfig, RegistryConfig};
use logharvest::harvester::ChannelPipeline;
use logharvest::input::{INPUT_TYPE, InputManager};
use logharvest::persistence::JsonFileDatabase;
use logharvest::store::Store;
use logharvest::watcher::WatchMode;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn input(id: &str, dir: &Path) -> InputConfig {
    let mut cfg = InputConfig {
        id: Some(id.to_string()),
        paths: vec![format!("{}/*.log", dir.display())],
        ..InputConfig::default()
    };
    cfg.file_identity.kind = "native".to_string();
    // Test files are far below the fingerprint window
    cfg.scanner.fingerprint.enabled = false;
    cfg.scanner.check_interval_ms = 50;
    cfg.scanner.watch_mode = WatchMode::Poll;
    cfg.backoff.init_ms = 10;
    cfg.backoff.max_ms = 50;
    cfg
}

fn config(registry: &Path, inputs: Vec<InputConfig>) -> Config {
    Config {
        registry: RegistryConfig {
            path: registry.to_path_buf(),
            flush_timeout_ms: 2000,
            ..RegistryConfig::default()
        },
        inputs,
    }
}

fn append(path: &Path, lines: &[&str]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
}

struct Running {
    cancel: CancellationToken,
    manager: JoinHandle<logharvest::error::Result<()>>,
    /// `(input id, message)` of every acknowledged event
    messages: mpsc::UnboundedReceiver<(String, String)>,
}

impl Running {
    fn start(config: Config) -> Self {
        let (pipeline, mut deliveries) = ChannelPipeline::new(64);
        let manager = InputManager::new(config, Arc::new(pipeline)).unwrap();
        manager.test().unwrap();

        let (tx, messages) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                let field = |name: &str| {
                    delivery.event.fields[name]
                        .as_str()
                        .unwrap_or_default()
                        .to_string()
                };
                let entry = (field("input.id"), field("message"));
                delivery.ack();
                if tx.send(entry).is_err() {
                    break;
                }
            }
        });

        let cancel = CancellationToken::new();
        let manager = tokio::spawn(manager.run(cancel.clone()));
        Self {
            cancel,
            manager,
            messages,
        }
    }

    async fn expect(&mut self, n: usize) -> Vec<(String, String)> {
        let mut received = Vec::with_capacity(n);
        while received.len() < n {
            let next = timeout(TEST_TIMEOUT, self.messages.recv())
                .await
                .expect("timed out waiting for events")
                .expect("output closed");
            received.push(next);
        }
        received
    }

    async fn stop(mut self) -> Vec<(String, String)> {
        // Give the update writer a moment to pick up the last acknowledgements
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.cancel.cancel();
        timeout(TEST_TIMEOUT, self.manager)
            .await
            .expect("input manager did not stop")
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        while let Ok(entry) = self.messages.try_recv() {
            rest.push(entry);
        }
        rest
    }
}

fn messages(received: &[(String, String)]) -> Vec<&str> {
    received.iter().map(|(_, m)| m.as_str()).collect()
}

/// Cursor offsets persisted for `input_id`, keyed by registry key.
fn persisted_offsets(registry: &Path, input_id: &str) -> Vec<(String, u64)> {
    let db = JsonFileDatabase::open(registry).unwrap();
    let store = Store::open(INPUT_TYPE, Arc::new(db.store(INPUT_TYPE))).unwrap();
    let prefix = format!("{}::{}::", INPUT_TYPE, input_id);
    let mut offsets: Vec<(String, u64)> = store
        .keys()
        .into_iter()
        .filter(|key| key.starts_with(&prefix))
        .filter_map(|key| {
            let cursor = store.snapshot(&key)?.cursor?;
            Some((key, cursor["offset"].as_u64()?))
        })
        .collect();
    offsets.sort();
    offsets
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resumes_from_registry_after_restart() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let registry: PathBuf = dir.path().join("data/registry.json");
    let log = logs.join("app.log");
    append(&log, &["line 1", "line 2", "line 3"]);

    let mut running = Running::start(config(&registry, vec![input("app", &logs)]));
    assert_eq!(
        vec!["line 1", "line 2", "line 3"],
        messages(&running.expect(3).await)
    );

    // Appended lines are picked up by the running harvester
    append(&log, &["line 4", "line 5"]);
    assert_eq!(vec!["line 4", "line 5"], messages(&running.expect(2).await));
    assert!(running.stop().await.is_empty());

    let offsets = persisted_offsets(&registry, "app");
    assert_eq!(1, offsets.len());
    assert!(offsets[0].0.starts_with("filestream::app::native::"));
    assert_eq!(35, offsets[0].1);

    // Only what was written while stopped is read after the restart
    append(&log, &["line 6"]);
    let mut running = Running::start(config(&registry, vec![input("app", &logs)]));
    assert_eq!(vec!["line 6"], messages(&running.expect(1).await));
    assert!(running.stop().await.is_empty());

    assert_eq!(42, persisted_offsets(&registry, "app")[0].1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inputs_keep_separate_states() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();
    let registry = dir.path().join("registry.json");
    append(&logs.join("app.log"), &["hello", "world"]);

    let mut running = Running::start(config(
        &registry,
        vec![input("first", &logs), input("second", &logs)],
    ));
    let mut received = running.expect(4).await;
    received.sort();
    assert_eq!(
        vec![
            ("first".to_string(), "hello".to_string()),
            ("first".to_string(), "world".to_string()),
            ("second".to_string(), "hello".to_string()),
            ("second".to_string(), "world".to_string()),
        ],
        received
    );
    assert!(running.stop().await.is_empty());

    let first = persisted_offsets(&registry, "first");
    let second = persisted_offsets(&registry, "second");
    assert_eq!(1, first.len());
    assert_eq!(1, second.len());
    assert_eq!(12, first[0].1);
    assert_eq!(12, second[0].1);
    // Same file, same identity, different input prefix
    assert_eq!(
        first[0].0.trim_start_matches("filestream::first::"),
        second[0].0.trim_start_matches("filestream::second::")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_files_are_discovered_while_running() {
    let dir = TempDir::new().unwrap();
    let registry = dir.path().join("registry.json");
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs).unwrap();

    let mut running = Running::start(config(&registry, vec![input("app", &logs)]));
    tokio::time::sleep(Duration::from_millis(100)).await;
    append(&logs.join("late.log"), &["arrived later"]);
    assert_eq!(vec!["arrived later"], messages(&running.expect(1).await));
    assert!(running.stop().await.is_empty());
}
