use anyhow::Result;
use async_trait::async_trait;
use metrics::histogram;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::{Instant, interval};

use crate::config::BatchConfig;
use crate::engine::BatchedEngine;
use crate::engine::Engine;
use crate::types::{InferenceScore, TokenSequence};

type Reply = oneshot::Sender<Result<InferenceScore>>;

#[derive(Debug)]
struct Pending {
    sequence: TokenSequence,
    reply: Reply,
}

/// Front half of the inference queue. Every `score` call goes through one
/// channel to a single [`BatchProcessor`], so the model is never invoked
/// concurrently.
pub struct BatchedEngineWrapper {
    submit: flume::Sender<Pending>,
}

impl BatchedEngineWrapper {
    pub fn new<T: BatchedEngine + 'static>(config: BatchConfig, model: T) -> (Self, BatchProcessor<T>) {
        // Senders wait until the processor takes their sequence.
        let (submit, incoming) = flume::bounded(0);
        let processor = BatchProcessor {
            incoming,
            config,
            pending: VecDeque::new(),
            model,
        };
        (Self { submit }, processor)
    }
}

#[async_trait]
impl Engine for BatchedEngineWrapper {
    #[tracing::instrument(skip(self, sequence), fields(length = sequence.len()))]
    async fn score(&self, sequence: TokenSequence) -> Result<InferenceScore> {
        let (reply, response) = oneshot::channel();
        self.submit
            .send_async(Pending { sequence, reply })
            .await
            .map_err(|_| anyhow::anyhow!("inference queue has shut down"))?;

        response
            .await
            .map_err(|_| anyhow::anyhow!("inference processor dropped the request"))?
    }
}

pub struct BatchProcessor<T: BatchedEngine> {
    incoming: flume::Receiver<Pending>,
    config: BatchConfig,
    pending: VecDeque<Pending>,
    model: T,
}

impl<T: BatchedEngine> BatchProcessor<T> {
    /// Runs until every [`BatchedEngineWrapper`] handle is dropped, then
    /// drains what is still queued.
    #[tracing::instrument(skip(self))]
    pub async fn run_forever(mut self) -> Result<()> {
        let mut flush = interval(self.config.tick_duration);

        loop {
            tokio::select! {
                next = self.incoming.recv_async() => {
                    let Ok(item) = next else {
                        tracing::info!(left = self.pending.len(), "Inference queue closed, draining");
                        while !self.pending.is_empty() {
                            self.score_next_batch().await;
                        }
                        return Ok(());
                    };
                    self.pending.push_back(item);
                    if self.pending.len() >= self.config.batch_size {
                        self.score_next_batch().await;
                    }
                }

                _ = flush.tick(), if !self.pending.is_empty() => {
                    self.score_next_batch().await;
                }
            }
        }
    }

    async fn score_next_batch(&mut self) {
        let take = self.config.batch_size.min(self.pending.len());
        if take == 0 {
            return;
        }
        let started = Instant::now();
        let (sequences, replies): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..take)
            .map(|item| (item.sequence, item.reply))
            .unzip();
        histogram!("inference_batch_size").record(take as f64);

        match self.model.score_batch(sequences).await {
            Ok(scores) if scores.len() == take => {
                for (reply, score) in replies.into_iter().zip(scores) {
                    let _ = reply.send(score);
                }
            }
            Ok(scores) => {
                let received = scores.len();
                tracing::error!(expected = take, received, "Model returned a mismatched number of scores");
                for reply in replies {
                    let _ = reply.send(Err(anyhow::anyhow!(
                        "model returned {received} scores for {take} sequences"
                    )));
                }
            }
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), size = take, "Scoring batch failed");
                for reply in replies {
                    let _ = reply.send(Err(anyhow::anyhow!("scoring batch failed: {err:#}")));
                }
            }
        }

        tracing::debug!(size = take, elapsed_ms = started.elapsed().as_millis(), "Scored batch");
    }
}
