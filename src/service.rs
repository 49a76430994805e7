use chrono::{SubsecRound, Utc};
use metrics::counter;
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::{Result, ServiceError};
use crate::history::HistoryStore;
use crate::policy::ClassificationPolicy;
use crate::tokenizer::SequenceEncoder;
use crate::types::PredictionRecord;

const EXCERPT_CHARS: usize = 64;

/// Outcome of one line of a batch request.
#[derive(Debug)]
pub struct BatchOutcome {
    pub index: usize,
    pub text: String,
    pub result: Result<PredictionRecord>,
}

/// Built once at startup and shared by every handler.
pub struct PredictionService {
    encoder: SequenceEncoder,
    engine: Arc<dyn Engine + Send + Sync>,
    policy: ClassificationPolicy,
    history: Arc<HistoryStore>,
}

impl PredictionService {
    pub fn new(
        encoder: SequenceEncoder,
        engine: Arc<dyn Engine + Send + Sync>,
        policy: ClassificationPolicy,
        history: HistoryStore,
    ) -> Self {
        Self {
            encoder,
            engine,
            policy,
            history: Arc::new(history),
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Validates, scores and records one text. The returned record is
    /// already in the history unless the durable write failed, in which case
    /// the failure is logged and the record is still returned.
    #[tracing::instrument(skip_all, fields(excerpt = %excerpt(text)))]
    pub async fn predict(&self, text: &str) -> Result<PredictionRecord> {
        if text.trim().is_empty() {
            tracing::debug!("Rejected empty input");
            return Err(ServiceError::InvalidInput);
        }

        let record = match self.infer(text).await {
            Ok(record) => record,
            Err(cause) => {
                counter!("prediction_failures_total").increment(1);
                tracing::error!(
                    excerpt = %excerpt(text),
                    at = %Utc::now().to_rfc3339(),
                    error = %format!("{cause:#}"),
                    "Prediction failed"
                );
                return Err(ServiceError::PredictionFailed(cause));
            }
        };

        counter!("predictions_total", "label" => record.classification.label.as_str())
            .increment(1);
        self.commit(&record).await;
        tracing::info!(
            prediction = record.classification.label.as_flag(),
            probability = record.score.value(),
            "Prediction recorded"
        );
        Ok(record)
    }

    /// Scores every line independently; results keep input order and one
    /// failing line never affects the others.
    #[tracing::instrument(skip_all, fields(batch_size = texts.len()))]
    pub async fn predict_batch(&self, texts: Vec<String>) -> Vec<BatchOutcome> {
        let predictions = texts.iter().map(|text| self.predict(text));
        let results = futures::future::join_all(predictions).await;

        texts
            .into_iter()
            .zip(results)
            .enumerate()
            .map(|(index, (text, result))| BatchOutcome {
                index,
                text,
                result,
            })
            .collect()
    }

    async fn infer(&self, text: &str) -> anyhow::Result<PredictionRecord> {
        let sequence = self.encoder.encode(text)?;
        let score = self.engine.score(sequence).await?;
        let classification = self.policy.classify(score);

        Ok(PredictionRecord {
            // The log keeps microseconds
            timestamp: Utc::now().trunc_subsecs(6),
            input_text: text.to_string(),
            classification,
            score,
        })
    }

    /// The synced write runs on the blocking pool.
    async fn commit(&self, record: &PredictionRecord) {
        let history = Arc::clone(&self.history);
        let pending = record.clone();
        let error = match tokio::task::spawn_blocking(move || history.append(pending)).await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{:#}", anyhow::Error::new(err)),
            Err(join) => format!("history write task failed: {join}"),
        };

        counter!("prediction_log_write_failures_total").increment(1);
        tracing::error!(
            event = "store_write_failed",
            excerpt = %excerpt(&record.input_text),
            at = %record.timestamp.to_rfc3339(),
            %error,
            "Prediction was served but not persisted"
        );
    }
}

fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append_log::AppendLog;
    use crate::batched_engine::BatchedEngineWrapper;
    use crate::config::BatchConfig;
    use crate::history::HistoryConfig;
    use crate::testing::{self, ScriptedModel};
    use crate::types::RiskLabel;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn history(dir: &TempDir, capacity: usize) -> HistoryStore {
        HistoryStore::open(HistoryConfig {
            path: dir.path().join("prediction_logs.csv"),
            capacity,
            default_threshold: 0.6,
        })
        .unwrap()
    }

    fn service(dir: &TempDir, capacity: usize) -> PredictionService {
        PredictionService::new(
            testing::encoder(16),
            Arc::new(ScriptedModel),
            ClassificationPolicy::new(0.6).unwrap(),
            history(dir, capacity),
        )
    }

    #[tokio::test]
    async fn low_score_is_low_risk_and_lands_in_history() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 20);

        let record = service.predict("I feel okay today").await.unwrap();

        assert_eq!(record.classification.label, RiskLabel::LowRisk);
        assert_eq!(record.classification.label.as_flag(), 0);
        assert_eq!(record.classification.message, "Low risk");
        assert_eq!(record.score.value(), testing::LOW_SCORE);

        let recent = service.history().recent(20);
        assert_eq!(recent.last(), Some(&record));
        assert_eq!(service.history().all().unwrap().count(), 1);
    }

    #[tokio::test]
    async fn high_score_is_high_risk() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 20);

        let record = service.predict("so hopeless").await.unwrap();
        assert_eq!(record.classification.label, RiskLabel::HighRisk);
        assert_eq!(record.classification.message, "High risk");
    }

    #[tokio::test]
    async fn blank_input_is_rejected_without_append() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 20);

        for text in ["", "   ", "\n\t "] {
            let err = service.predict(text).await.unwrap_err();
            assert!(matches!(err, ServiceError::InvalidInput));
        }
        assert!(service.history().recent(20).is_empty());
        assert_eq!(service.history().all().unwrap().count(), 0);
    }

    #[tokio::test]
    async fn engine_failure_is_wrapped_and_not_recorded() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 20);

        let err = service.predict("poison").await.unwrap_err();
        assert!(matches!(err, ServiceError::PredictionFailed(_)));
        assert_eq!(service.history().all().unwrap().count(), 0);
    }

    #[tokio::test]
    async fn batch_isolates_each_line() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 20);

        let outcomes = service
            .predict_batch(vec![
                String::new(),
                "I feel okay".to_string(),
                "poison".to_string(),
            ])
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes.iter().map(|o| o.index).collect::<Vec<_>>(),
            [0, 1, 2]
        );
        assert!(matches!(outcomes[0].result, Err(ServiceError::InvalidInput)));
        let ok = outcomes[1].result.as_ref().unwrap();
        assert_eq!(ok.input_text, "I feel okay");
        assert_eq!(ok.classification.label, RiskLabel::LowRisk);
        assert!(matches!(
            outcomes[2].result,
            Err(ServiceError::PredictionFailed(_))
        ));
        assert_eq!(service.history().all().unwrap().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_predictions_keep_window_a_suffix_of_the_log() {
        let dir = TempDir::new().unwrap();
        let (engine, processor) = BatchedEngineWrapper::new(
            BatchConfig {
                batch_size: 4,
                tick_duration: Duration::from_millis(2),
            },
            ScriptedModel,
        );
        tokio::spawn(processor.run_forever());
        let service = Arc::new(PredictionService::new(
            testing::encoder(16),
            Arc::new(engine),
            ClassificationPolicy::new(0.6).unwrap(),
            history(&dir, 20),
        ));

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let text = if i % 5 == 0 {
                        format!("hopeless {i}")
                    } else {
                        format!("okay {i}")
                    };
                    service.predict(&text).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let durable: Vec<_> = service.history().all().unwrap().collect();
        assert_eq!(durable.len(), 50);

        let recent = service.history().recent(20);
        assert_eq!(recent.len(), 20);
        assert_eq!(recent.as_slice(), &durable[30..]);
    }

    #[tokio::test]
    async fn store_failure_still_returns_the_prediction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prediction_logs.csv");
        std::fs::write(&path, "").unwrap();
        let read_only = std::fs::File::open(&path).unwrap();
        let store = HistoryStore::with_log(
            HistoryConfig {
                path: path.clone(),
                capacity: 20,
                default_threshold: 0.6,
            },
            AppendLog::from_file(&path, read_only),
        );
        let service = PredictionService::new(
            testing::encoder(16),
            Arc::new(ScriptedModel),
            ClassificationPolicy::new(0.6).unwrap(),
            store,
        );

        let record = service.predict("I feel okay").await.unwrap();
        assert_eq!(record.classification.label, RiskLabel::LowRisk);
        assert!(service.history().recent(20).is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn commit_waits_off_the_async_workers() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(service(&dir, 20));
        let released = Arc::new(AtomicBool::new(false));

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn({
            let service = Arc::clone(&service);
            let released = Arc::clone(&released);
            move || {
                let guard = service.history().hold_lock();
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(300));
                released.store(true, Ordering::SeqCst);
                drop(guard);
            }
        });
        locked_rx.recv().unwrap();

        let task = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.predict("I feel okay").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The runtime's only thread kept running while the write waited.
        assert!(!released.load(Ordering::SeqCst));
        assert!(!task.is_finished());

        let record = task.await.unwrap().unwrap();
        holder.join().unwrap();
        assert_eq!(service.history().recent(20), [record]);
    }

    #[test]
    fn excerpt_truncates_long_text() {
        let long = "a".repeat(100);
        let short = excerpt(&long);
        assert_eq!(short.chars().count(), EXCERPT_CHARS + 1);
        assert_eq!(excerpt("short"), "short");
    }
}
