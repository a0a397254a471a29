use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::checkpoint::CheckpointStore;
use crate::envelope::Envelope;
use crate::error::HarvestError;
use crate::extractor::ContentExtractor;
use crate::fetcher::{FetchOutcome, PageFetcher};
use crate::publisher::Publisher;

/// Why a cycle ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The archive answered `status` for `sequence`: nothing newer is published yet.
    Drained { sequence: u64, status: u16 },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub started_at: u64,
    pub last_sequence: u64,
    pub published: usize,
    pub stop: StopReason,
}

/// Sequential scan over one source: probe, extract, publish, advance, repeat.
///
/// The checkpoint is read once per cycle and written once per document, only
/// after both sinks accepted it. Any failure leaves it at the last advanced id.
pub struct Harvester {
    source_id: String,
    checkpoints: Arc<dyn CheckpointStore>,
    fetcher: Arc<dyn PageFetcher>,
    extractor: ContentExtractor,
    publisher: Publisher,
}

impl Harvester {
    pub fn new(
        source_id: &str,
        checkpoints: Arc<dyn CheckpointStore>,
        fetcher: Arc<dyn PageFetcher>,
        extractor: ContentExtractor,
        publisher: Publisher,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            checkpoints,
            fetcher,
            extractor,
            publisher,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, HarvestError> {
        let span = info_span!("cycle", service = %self.source_id);
        self.scan(cancel).instrument(span).await
    }

    async fn scan(&self, cancel: &CancellationToken) -> Result<CycleReport, HarvestError> {
        let started_at = self.load_checkpoint().await?;
        let mut cursor = started_at;
        let mut published = 0usize;
        info!(checkpoint = started_at, "cycle started");

        let stop = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let sequence = cursor.checked_add(1).ok_or_else(|| {
                HarvestError::Config(format!(
                    "checkpoint for `{}` is at {} and cannot advance",
                    self.source_id, cursor
                ))
            })?;
            let (uri, body) = match self.fetcher.fetch(sequence).await {
                Ok(FetchOutcome::Found { uri, body }) => (uri, body),
                Ok(FetchOutcome::NotFound { uri, status }) => {
                    info!("{} returned {}, stopping", uri, status);
                    break StopReason::Drained { sequence, status };
                }
                Err(e) => {
                    return Err(HarvestError::Transport {
                        sequence,
                        uri: e.uri.clone(),
                        source: Box::new(e),
                    })
                }
            };

            let text = self
                .extractor
                .extract(&body)
                .map_err(|kind| HarvestError::ContentFormat {
                    sequence,
                    uri: uri.clone(),
                    kind,
                })?;

            let envelope = Envelope::build(&self.source_id, text, &uri);
            self.publisher
                .publish(&envelope)
                .await
                .map_err(|e| HarvestError::Sink {
                    sequence,
                    uri: uri.clone(),
                    sink: e.sink(),
                    source: e.into_inner().into(),
                })?;

            self.checkpoints
                .store(&self.source_id, sequence)
                .await
                .map_err(|e| HarvestError::Checkpoint {
                    sequence,
                    source: e.into(),
                })?;

            cursor = sequence;
            published += 1;
            debug!(sequence, id = %envelope.id, "advanced checkpoint");
        };

        let report = CycleReport {
            started_at,
            last_sequence: cursor,
            published,
            stop,
        };
        info!(
            "cycle finished: {} published, checkpoint {} -> {}",
            report.published, report.started_at, report.last_sequence
        );
        Ok(report)
    }

    async fn load_checkpoint(&self) -> Result<u64, HarvestError> {
        let stored = self
            .checkpoints
            .load(&self.source_id)
            .await
            .map_err(|e| {
                // An unparseable value is an operator problem, not a transient one.
                if e.chain().any(|c| c.is::<std::num::ParseIntError>()) {
                    HarvestError::Config(format!("{:#}", e))
                } else {
                    HarvestError::Storage {
                        source_id: self.source_id.clone(),
                        source: e.into(),
                    }
                }
            })?;
        stored.ok_or_else(|| {
            HarvestError::Config(format!(
                "no checkpoint for `{}`; seed it before the first run",
                self.source_id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::SinkKind;
    use crate::fetcher::FetchError;
    use crate::queue::{DeliveryQueue, SqliteQueue};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    const PAGE: &str = "<html><body><article class=\"item\"><p>Notice</p></article></body></html>";
    const SERVICE: &str = "Bulletins";
    const QUEUE: &str = "documents";

    #[derive(Clone, Copy)]
    enum Scripted {
        Page,
        Missing,
        Layout,
        Refused,
    }

    /// Fetcher answering from a script; anything unscripted is a 404.
    #[derive(Default)]
    struct ScriptedFetcher {
        script: Mutex<HashMap<u64, Scripted>>,
        probes: Mutex<Vec<u64>>,
    }

    impl ScriptedFetcher {
        fn with(entries: &[(u64, Scripted)]) -> Arc<Self> {
            let f = Self::default();
            f.script.lock().unwrap().extend(entries.iter().copied());
            Arc::new(f)
        }

        fn set(&self, sequence: u64, answer: Scripted) {
            self.script.lock().unwrap().insert(sequence, answer);
        }

        fn probes(&self) -> Vec<u64> {
            self.probes.lock().unwrap().clone()
        }
    }

    fn uri(sequence: u64) -> String {
        format!("https://archive.example/item/{}", sequence)
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(&self, sequence: u64) -> Result<FetchOutcome, FetchError> {
            self.probes.lock().unwrap().push(sequence);
            let answer = self.script.lock().unwrap().get(&sequence).copied();
            let uri = uri(sequence);
            match answer.unwrap_or(Scripted::Missing) {
                Scripted::Page => Ok(FetchOutcome::Found {
                    uri,
                    body: PAGE.as_bytes().to_vec(),
                }),
                Scripted::Layout => Ok(FetchOutcome::Found {
                    uri,
                    body: b"<html><body><section>moved</section></body></html>".to_vec(),
                }),
                Scripted::Missing => Ok(FetchOutcome::NotFound { uri, status: 404 }),
                Scripted::Refused => {
                    let client = reqwest::Client::new();
                    // port 1 on loopback is never listening
                    let source = client
                        .get("http://127.0.0.1:1/")
                        .send()
                        .await
                        .expect_err("nothing listens on port 1");
                    Err(FetchError { uri, source })
                }
            }
        }
    }

    /// Outbox queue that can be switched off.
    struct FlakyQueue {
        inner: SqliteQueue,
        down: AtomicBool,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryQueue for FlakyQueue {
        async fn send(&self, body: &str) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                anyhow::bail!("queue unavailable");
            }
            self.inner.send(body).await
        }

        fn name(&self) -> &str {
            self.inner.name()
        }
    }

    struct Rig {
        db: Arc<Database>,
        fetcher: Arc<ScriptedFetcher>,
        queue: Arc<FlakyQueue>,
        harvester: Harvester,
    }

    fn rig(checkpoint: Option<u64>, script: &[(u64, Scripted)]) -> Rig {
        let db = Arc::new(Database::open_in_memory().unwrap());
        if let Some(n) = checkpoint {
            db.set_last_id(SERVICE, &n.to_string()).unwrap();
        }
        let fetcher = ScriptedFetcher::with(script);
        let queue = Arc::new(FlakyQueue {
            inner: SqliteQueue::new(Arc::clone(&db), QUEUE),
            down: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        });
        let harvester = Harvester::new(
            SERVICE,
            db.clone(),
            fetcher.clone(),
            ContentExtractor::new("article.item").unwrap(),
            Publisher::new(db.clone(), queue.clone()),
        );
        Rig {
            db,
            fetcher,
            queue,
            harvester,
        }
    }

    impl Rig {
        async fn checkpoint(&self) -> Option<u64> {
            self.db.load(SERVICE).await.unwrap()
        }

        async fn cycle(&self) -> Result<CycleReport, HarvestError> {
            self.harvester.run_cycle(&CancellationToken::new()).await
        }
    }

    #[tokio::test]
    async fn two_pages_then_not_found() {
        let r = rig(Some(10), &[(11, Scripted::Page), (12, Scripted::Page)]);
        let report = r.cycle().await.unwrap();

        assert_eq!(
            report,
            CycleReport {
                started_at: 10,
                last_sequence: 12,
                published: 2,
                stop: StopReason::Drained {
                    sequence: 13,
                    status: 404
                },
            }
        );
        assert_eq!(r.queue.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(r.checkpoint().await, Some(12));
        assert_eq!(r.fetcher.probes(), vec![11, 12, 13]);
        assert_eq!(r.db.queued_bodies(QUEUE).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_cycle_leaves_checkpoint() {
        let r = rig(Some(10), &[]);
        let report = r.cycle().await.unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(r.checkpoint().await, Some(10));
    }

    #[tokio::test]
    async fn checkpoint_advances_by_one_per_document_across_cycles() {
        let r = rig(Some(0), &[(1, Scripted::Page)]);
        let mut seen = vec![r.checkpoint().await.unwrap()];

        r.cycle().await.unwrap();
        seen.push(r.checkpoint().await.unwrap());

        r.fetcher.set(2, Scripted::Page);
        r.fetcher.set(3, Scripted::Page);
        r.cycle().await.unwrap();
        seen.push(r.checkpoint().await.unwrap());

        r.cycle().await.unwrap();
        seen.push(r.checkpoint().await.unwrap());

        assert_eq!(seen, vec![0, 1, 3, 3]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn transport_error_keeps_checkpoint_and_reprobes() {
        let r = rig(Some(10), &[(11, Scripted::Refused)]);
        let err = r.cycle().await.unwrap_err();
        match &err {
            HarvestError::Transport { sequence, uri: u, .. } => {
                assert_eq!(*sequence, 11);
                assert_eq!(u, &uri(11));
            }
            other => panic!("expected transport error, got {:?}", other),
        }
        assert!(!err.is_fatal());
        assert_eq!(r.checkpoint().await, Some(10));

        r.fetcher.set(11, Scripted::Page);
        let report = r.cycle().await.unwrap();
        assert_eq!(r.fetcher.probes(), vec![11, 11, 12]);
        assert_eq!(report.last_sequence, 11);
    }

    #[tokio::test]
    async fn queue_failure_duplicates_the_store_record_on_retry() {
        let r = rig(Some(10), &[(11, Scripted::Page)]);
        r.queue.down.store(true, Ordering::SeqCst);

        let err = r.cycle().await.unwrap_err();
        assert!(matches!(
            err,
            HarvestError::Sink {
                sequence: 11,
                sink: SinkKind::Queue,
                ..
            }
        ));
        assert_eq!(r.checkpoint().await, Some(10));

        r.queue.down.store(false, Ordering::SeqCst);
        r.cycle().await.unwrap();
        assert_eq!(r.checkpoint().await, Some(11));

        let records = r.db.documents_for_uri(&uri(11)).unwrap();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].id, records[1].id);
        assert_eq!(r.db.queued_bodies(QUEUE).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_region_aborts_without_advancing() {
        let r = rig(Some(10), &[(11, Scripted::Page), (12, Scripted::Layout), (13, Scripted::Page)]);
        let err = r.cycle().await.unwrap_err();
        match err {
            HarvestError::ContentFormat { sequence, kind, .. } => {
                assert_eq!(sequence, 12);
                assert!(matches!(kind, crate::error::ExtractError::NoContentFound { .. }));
            }
            other => panic!("expected content format error, got {:?}", other),
        }
        assert_eq!(r.checkpoint().await, Some(11));
        assert_eq!(r.fetcher.probes(), vec![11, 12]);
    }

    #[tokio::test]
    async fn unseeded_source_is_fatal() {
        let r = rig(None, &[(1, Scripted::Page)]);
        let err = r.cycle().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(r.fetcher.probes().is_empty());
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_fatal() {
        let r = rig(None, &[]);
        r.db.set_last_id(SERVICE, "eleven").unwrap();
        assert!(r.cycle().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn exhausted_checkpoint_is_fatal_and_never_wraps() {
        let r = rig(None, &[(0, Scripted::Page)]);
        crate::checkpoint::seed(r.db.as_ref(), SERVICE, u64::MAX, false)
            .await
            .unwrap();

        let err = r.cycle().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(r.fetcher.probes().is_empty());
        assert_eq!(r.checkpoint().await, Some(u64::MAX));
    }

    #[tokio::test]
    async fn cancelled_before_probe_stops_cleanly() {
        let r = rig(Some(10), &[(11, Scripted::Page)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = r.harvester.run_cycle(&cancel).await.unwrap();
        assert_eq!(report.stop, StopReason::Cancelled);
        assert_eq!(report.published, 0);
        assert!(r.fetcher.probes().is_empty());
        assert_eq!(r.checkpoint().await, Some(10));
    }
}
