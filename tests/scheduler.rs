use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tempfile::{tempdir, TempDir};
use voxclone::backends::{SynthesisBackend, SynthesisRequest};
use voxclone::gateway::SynthesisGateway;
use voxclone::profiles::{PreparedSample, ProfileStore};
use voxclone::scheduler::{GenerationRequest, GenerationScheduler};
use voxclone::{audio, Error};

#[derive(Debug, Clone)]
struct Call {
    text: String,
    references: usize,
    started: Instant,
    finished: Instant,
}

/// Records every inference. Text "hold" blocks until the gate opens.
struct RecordingBackend {
    calls: Arc<Mutex<Vec<Call>>>,
    busy: Arc<AtomicBool>,
    holding: Arc<AtomicBool>,
    gate: Receiver<()>,
}

impl SynthesisBackend for RecordingBackend {
    fn id(&self) -> &'static str {
        "recording"
    }

    fn load(&mut self) -> voxclone::Result<()> {
        Ok(())
    }

    fn synthesize(&mut self, request: &SynthesisRequest) -> voxclone::Result<Vec<u8>> {
        assert!(!self.busy.swap(true, Ordering::SeqCst), "overlapping inference");
        let started = Instant::now();
        if request.text == "hold" {
            self.holding.store(true, Ordering::SeqCst);
            let _ = self.gate.recv_timeout(Duration::from_secs(10));
        } else {
            std::thread::sleep(Duration::from_millis(20));
        }
        self.calls.lock().unwrap().push(Call {
            text: request.text.clone(),
            references: request.references.len(),
            started,
            finished: Instant::now(),
        });
        self.busy.store(false, Ordering::SeqCst);
        Ok(request.text.as_bytes().to_vec())
    }
}

struct Fixture {
    _dir: TempDir,
    store: Arc<ProfileStore>,
    scheduler: GenerationScheduler,
    calls: Arc<Mutex<Vec<Call>>>,
    holding: Arc<AtomicBool>,
    gate: Sender<()>,
}

impl Fixture {
    fn new(max_wait: Duration) -> Self {
        let dir = tempdir().unwrap();
        let store = Arc::new(ProfileStore::open(dir.path()).unwrap());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let holding = Arc::new(AtomicBool::new(false));
        let (gate, gate_rx) = channel();
        let backend = RecordingBackend {
            calls: calls.clone(),
            busy: Arc::new(AtomicBool::new(false)),
            holding: holding.clone(),
            gate: gate_rx,
        };
        let gateway = Arc::new(SynthesisGateway::new(Box::new(backend)));
        let scheduler = GenerationScheduler::start(gateway, store.clone(), max_wait).unwrap();
        Self {
            _dir: dir,
            store,
            scheduler,
            calls,
            holding,
            gate,
        }
    }

    fn profile(&self, name: &str, samples: usize) -> String {
        let wav = audio::pcm16_to_wav(&[500; 2205], 22050).unwrap();
        let prepared = (0..samples)
            .map(|i| PreparedSample {
                filename: format!("s{}.wav", i),
                wav: wav.clone(),
                duration_secs: 0.1,
                sample_rate: 22050,
                channels: 1,
            })
            .collect();
        self.store.create(name, None, prepared).unwrap().profile_id
    }

    async fn wait_until(&self, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn texts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.text.clone()).collect()
    }
}

fn assert_no_overlap(calls: &[Call]) {
    for pair in calls.windows(2) {
        assert!(pair[0].finished <= pair[1].started, "inferences overlapped");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_are_serialized_and_routed_back() {
    let f = Fixture::new(Duration::from_secs(5));
    let id = f.profile("Test", 2);

    let results = join_all(
        ["first", "second", "third"]
            .iter()
            .map(|t| f.scheduler.submit(GenerationRequest::new(&id, t, "en"))),
    )
    .await;

    let audio: Vec<Vec<u8>> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(audio, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);

    let calls = f.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.references == 2));
    assert_no_overlap(&calls);
    assert_eq!(f.scheduler.pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_is_serviced_in_submission_order() {
    let f = Arc::new(Fixture::new(Duration::from_secs(5)));
    let id = f.profile("Fifo", 1);

    let mut tasks = Vec::new();
    let submit = |text: &str| {
        let f = f.clone();
        let req = GenerationRequest::new(&id, text, "en");
        tokio::spawn(async move { f.scheduler.submit(req).await })
    };

    tasks.push(submit("hold"));
    f.wait_until(|| f.holding.load(Ordering::SeqCst)).await;
    for (i, text) in ["r1", "r2", "r3", "r4"].iter().enumerate() {
        tasks.push(submit(text));
        f.wait_until(|| f.scheduler.pending() == i + 2).await;
    }

    f.gate.send(()).unwrap();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(f.texts(), vec!["hold", "r1", "r2", "r3", "r4"]);
    assert_no_overlap(&f.calls.lock().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn profile_deleted_while_queued_is_stale() {
    let f = Arc::new(Fixture::new(Duration::from_secs(5)));
    let blocker = f.profile("Blocker", 1);
    let doomed = f.profile("Doomed", 1);
    let other = f.profile("Other", 1);

    let spawn = |id: &str, text: &str| {
        let f = f.clone();
        let req = GenerationRequest::new(id, text, "en");
        tokio::spawn(async move { f.scheduler.submit(req).await })
    };

    let held = spawn(&blocker, "hold");
    f.wait_until(|| f.holding.load(Ordering::SeqCst)).await;
    let stale = spawn(&doomed, "doomed");
    f.wait_until(|| f.scheduler.pending() == 2).await;
    let fine = spawn(&other, "other");
    f.wait_until(|| f.scheduler.pending() == 3).await;

    f.store.delete(&doomed).unwrap();
    f.gate.send(()).unwrap();

    assert_eq!(held.await.unwrap().unwrap(), b"hold");
    assert!(matches!(stale.await.unwrap(), Err(Error::StaleProfile(ref id)) if *id == doomed));
    assert_eq!(fine.await.unwrap().unwrap(), b"other");
    assert_eq!(f.texts(), vec!["hold", "other"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_bound_yields_timeout() {
    let f = Fixture::new(Duration::from_secs(5));
    let id = f.profile("Slow", 1);

    let err = f
        .scheduler
        .submit_with_timeout(
            GenerationRequest::new(&id, "hold", "en"),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(50)));

    // The worker finishes the in-flight call and keeps serving
    f.gate.send(()).unwrap();
    let audio = f
        .scheduler
        .submit(GenerationRequest::new(&id, "after", "en"))
        .await
        .unwrap();
    assert_eq!(audio, b"after");
}

#[tokio::test]
async fn submissions_are_validated_up_front() {
    let f = Fixture::new(Duration::from_secs(5));
    let empty = f.profile("Empty", 0);
    let voiced = f.profile("Voiced", 1);

    let submit = |id: &str, text: &str, lang: &str| {
        f.scheduler.submit(GenerationRequest::new(id, text, lang))
    };

    assert!(matches!(submit(&empty, "hi", "en").await, Err(Error::InsufficientSamples(_))));
    assert!(matches!(submit("profile_nope", "hi", "en").await, Err(Error::NotFound(_))));
    assert!(matches!(submit(&voiced, "   ", "en").await, Err(Error::Validation(_))));
    assert!(matches!(submit(&voiced, "hi", "klingon").await, Err(Error::Validation(_))));
    assert!(f.calls.lock().unwrap().is_empty());
}
