//! End-to-end pipeline tests
//!
//! A fake story source, a local asset server and in-memory storage stand in
//! for the external services; everything else is the real broker, stage
//! handlers and failure notifier.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Router, extract::Path as UrlPath, http::StatusCode, routing::get};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use storyrelay::config::Config;
use storyrelay::instagram::{AuthError, Reply, Session, StorySource, TrayUser};
use storyrelay::notify::{Notifier, NotifyError};
use storyrelay::queue::{Broker, BrokerConfig, BrokerEvent, JobOptions, JobPayload, JobStatus, Stage};
use storyrelay::stages::{MediaKind, StoryItem};
use storyrelay::storage::StorageClient;
use storyrelay::worker::http::{HttpClient, HttpConfig};
use storyrelay::worker::{Collaborators, Pipeline};

struct FakeSource {
    users: Vec<(String, Vec<StoryItem>)>,
}

#[async_trait]
impl StorySource for FakeSource {
    async fn login(&self, mut saved: Session) -> Result<Session, AuthError> {
        saved.user_id = Some("1".into());
        saved.cookies.insert("sessionid".into(), "test".into());
        Ok(saved)
    }

    async fn reels_tray(&self, session: &Session) -> Result<Reply<Vec<TrayUser>>, AuthError> {
        let users = self
            .users
            .iter()
            .enumerate()
            .map(|(i, (username, _))| TrayUser {
                pk: (i + 1).to_string(),
                username: username.clone(),
            })
            .collect();
        Ok(Reply {
            value: users,
            session: session.clone(),
        })
    }

    async fn user_story(&self, session: &Session, user: &TrayUser) -> Result<Reply<Vec<StoryItem>>, AuthError> {
        let items = self
            .users
            .iter()
            .find(|(username, _)| *username == user.username)
            .map(|(_, items)| items.clone())
            .unwrap_or_default();
        Ok(Reply {
            value: items,
            session: session.clone(),
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

/// Serves `bytes of <name>`; `broken*` always fails, `flaky*` fails the
/// first request for each name
async fn asset_server() -> String {
    let flaked: Arc<Mutex<HashSet<String>>> = Arc::default();
    let router = Router::new().route(
        "/media/{name}",
        get(move |UrlPath(name): UrlPath<String>| async move {
            if name.starts_with("broken") {
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
            if name.starts_with("flaky") && flaked.lock().unwrap().insert(name.clone()) {
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
            Ok(format!("bytes of {name}"))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{addr}")
}

fn item(kind: MediaKind, url: String, taken_at: i64) -> StoryItem {
    StoryItem {
        kind,
        url: Some(url),
        taken_at: Some(taken_at),
    }
}

fn fast_broker(dir: &TempDir) -> Broker {
    Broker::open(
        dir.path().join("queue"),
        BrokerConfig {
            poll_interval: Duration::from_millis(20),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            ..BrokerConfig::default()
        },
    )
    .unwrap()
}

fn test_config(dir: &TempDir, whitelist: &[&str]) -> Config {
    let mut config = Config::default();
    config.schedule.enabled = false;
    config.download.root = dir.path().join("downloads");
    config.instagram.session_path = dir.path().join("session.json");
    config.instagram.whitelist = whitelist.iter().map(|u| u.to_string()).collect();
    config.stages.download.max_attempts = 1;
    config.stages.upload.max_attempts = 2;
    config
}

fn collaborators(
    source: FakeSource,
    storage: Option<Arc<StorageClient>>,
    notifier: Arc<RecordingNotifier>,
) -> Collaborators {
    Collaborators {
        source: Arc::new(source),
        http: Arc::new(HttpClient::new(HttpConfig::default(), None).unwrap()),
        storage,
        notifier: Some(notifier),
    }
}

/// Wait for the first terminal event of `stage`
async fn wait_for(events: &mut broadcast::Receiver<BrokerEvent>, stage: Stage) -> BrokerEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            let job = match &event {
                BrokerEvent::Completed { job } | BrokerEvent::Failed { job, .. } => job,
                BrokerEvent::Retrying { .. } => continue,
            };
            if job.stage == stage {
                return event;
            }
        }
    })
    .await
    .expect("no terminal event for stage")
}

async fn trigger_fetch(broker: &Broker) {
    broker
        .enqueue(JobPayload::Fetch, JobOptions::new(1, Duration::from_secs(30)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stories_travel_from_source_to_storage() {
    let dir = TempDir::new().unwrap();
    let assets = asset_server().await;
    let storage = Arc::new(StorageClient::in_memory("instagram"));
    let notifier = Arc::new(RecordingNotifier::default());

    // 2023-11-14 22:13 and 22:14 UTC
    let source = FakeSource {
        users: vec![
            (
                "alice".into(),
                vec![
                    item(MediaKind::Photo, format!("{assets}/media/a1.jpg"), 1_700_000_000),
                    item(MediaKind::Photo, format!("{assets}/media/a2.jpg"), 1_700_000_060),
                    item(MediaKind::Video, format!("{assets}/media/a3.mp4"), 1_700_000_000),
                ],
            ),
            ("bob".into(), Vec::new()),
            (
                "mallory".into(),
                vec![item(MediaKind::Photo, format!("{assets}/media/m1.jpg"), 1_700_000_000)],
            ),
        ],
    };

    let config = test_config(&dir, &["alice", "bob"]);
    let broker = fast_broker(&dir);
    let mut events = broker.subscribe();
    let pipeline = Pipeline::start_with_broker(
        broker.clone(),
        &config,
        collaborators(source, Some(storage.clone()), notifier.clone()),
    )
    .await
    .unwrap();

    trigger_fetch(&broker).await;
    let event = wait_for(&mut events, Stage::Upload).await;
    assert!(matches!(event, BrokerEvent::Completed { .. }));

    let mut keys = storage.list_keys(None).await.unwrap();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            "alice/2023_11_14__22_13.jpg",
            "alice/2023_11_14__22_13.mp4",
            "alice/2023_11_14__22_14.jpg",
        ]
    );
    assert_eq!(
        storage.download("alice/2023_11_14__22_13.mp4").await.unwrap(),
        b"bytes of a3.mp4".to_vec()
    );

    let counts = broker.counts().unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.failed, 0);
    assert!(notifier.messages.lock().unwrap().is_empty());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_storage_fails_upload_and_notifies_once() {
    let dir = TempDir::new().unwrap();
    let assets = asset_server().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let source = FakeSource {
        users: vec![(
            "alice".into(),
            vec![item(MediaKind::Photo, format!("{assets}/media/a1.jpg"), 1_700_000_000)],
        )],
    };

    let config = test_config(&dir, &["alice"]);
    let broker = fast_broker(&dir);
    let mut events = broker.subscribe();
    let pipeline = Pipeline::start_with_broker(broker.clone(), &config, collaborators(source, None, notifier.clone()))
        .await
        .unwrap();

    trigger_fetch(&broker).await;
    let BrokerEvent::Failed { job, error } = wait_for(&mut events, Stage::Upload).await else {
        panic!("upload job should fail");
    };
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts_made, 2);
    assert!(error.contains("configuration"), "unexpected error: {error}");

    // The notifier runs on its own task
    let messages = timeout(Duration::from_secs(5), async {
        loop {
            let messages = notifier.messages.lock().unwrap().clone();
            if !messages.is_empty() {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifier.messages.lock().unwrap().len(), 1);
    assert!(messages[0].starts_with(&format!("Job \"upload\" #{} failed after 2 attempts:", job.id)));

    // The downloaded file stays behind for a later retry
    assert!(dir.path().join("downloads/alice/2023_11_14__22_13.jpg").exists());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broken_asset_fails_download_without_upload() {
    let dir = TempDir::new().unwrap();
    let assets = asset_server().await;
    let storage = Arc::new(StorageClient::in_memory("instagram"));
    let notifier = Arc::new(RecordingNotifier::default());
    let source = FakeSource {
        users: vec![(
            "alice".into(),
            vec![
                item(MediaKind::Photo, format!("{assets}/media/a1.jpg"), 1_700_000_000),
                item(MediaKind::Photo, format!("{assets}/media/broken.jpg"), 1_700_000_060),
            ],
        )],
    };

    let config = test_config(&dir, &["alice"]);
    let broker = fast_broker(&dir);
    let mut events = broker.subscribe();
    let pipeline = Pipeline::start_with_broker(
        broker.clone(),
        &config,
        collaborators(source, Some(storage.clone()), notifier),
    )
    .await
    .unwrap();

    trigger_fetch(&broker).await;
    let event = wait_for(&mut events, Stage::Download).await;
    assert!(matches!(event, BrokerEvent::Failed { .. }));

    let jobs = broker.list(None, 10).unwrap();
    assert!(jobs.iter().all(|job| job.stage != Stage::Upload));
    assert!(storage.list_keys(None).await.unwrap().is_empty());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_asset_retries_whole_download() {
    let dir = TempDir::new().unwrap();
    let assets = asset_server().await;
    let storage = Arc::new(StorageClient::in_memory("instagram"));
    let notifier = Arc::new(RecordingNotifier::default());
    // Five stories a minute apart from 2023-11-14 22:13 UTC, the third fails once
    let names = ["c1.jpg", "c2.jpg", "flaky.jpg", "c4.jpg", "c5.jpg"];
    let source = FakeSource {
        users: vec![(
            "carol".into(),
            names
                .iter()
                .enumerate()
                .map(|(i, name)| item(MediaKind::Photo, format!("{assets}/media/{name}"), 1_700_000_000 + 60 * i as i64))
                .collect(),
        )],
    };

    let mut config = test_config(&dir, &["carol"]);
    config.stages.download.max_attempts = 2;
    let broker = fast_broker(&dir);
    let mut events = broker.subscribe();
    let pipeline = Pipeline::start_with_broker(
        broker.clone(),
        &config,
        collaborators(source, Some(storage.clone()), notifier.clone()),
    )
    .await
    .unwrap();

    trigger_fetch(&broker).await;
    let BrokerEvent::Completed { job } = wait_for(&mut events, Stage::Download).await else {
        panic!("download should succeed on its second attempt");
    };
    // Counts failed attempts only
    assert_eq!(job.attempts_made, 1);

    let event = wait_for(&mut events, Stage::Upload).await;
    assert!(matches!(event, BrokerEvent::Completed { .. }));

    let files = std::fs::read_dir(dir.path().join("downloads/carol")).unwrap().count();
    assert_eq!(files, 5);
    assert_eq!(
        std::fs::read(dir.path().join("downloads/carol/2023_11_14__22_15.jpg")).unwrap(),
        b"bytes of flaky.jpg".to_vec()
    );

    let keys = storage.list_keys(Some("carol/")).await.unwrap();
    assert_eq!(keys.len(), 5);
    assert_eq!(broker.counts().unwrap().failed, 0);
    assert!(notifier.messages.lock().unwrap().is_empty());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nothing_whitelisted_stops_after_fetch() {
    let dir = TempDir::new().unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let source = FakeSource {
        users: vec![("mallory".into(), Vec::new())],
    };

    let config = test_config(&dir, &[]);
    let broker = fast_broker(&dir);
    let mut events = broker.subscribe();
    let pipeline = Pipeline::start_with_broker(broker.clone(), &config, collaborators(source, None, notifier))
        .await
        .unwrap();

    trigger_fetch(&broker).await;
    let event = wait_for(&mut events, Stage::Fetch).await;
    assert!(matches!(event, BrokerEvent::Completed { .. }));

    let stages: HashMap<Stage, usize> = broker.list(None, 10).unwrap().iter().fold(HashMap::new(), |mut acc, job| {
        *acc.entry(job.stage).or_default() += 1;
        acc
    });
    assert_eq!(stages.get(&Stage::Fetch), Some(&1));
    assert_eq!(stages.len(), 1);

    pipeline.shutdown().await.unwrap();
}
