use std::sync::Arc;
use std::time::Instant;

use async_openai::types::CreateEmbeddingRequestArgs;
use async_openai::{Client, config::Config};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::style::ProgressStyle;

use crate::error::{AppError, AppResult};
use crate::retry::{RateLimiter, RetryPolicy};
use crate::store::{ProcessingStatus, Store};

/// Trait for converting text into vector embeddings.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts.
    /// Returns one embedding per input, in input order.
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>>;
}

/// Remote failures worth another attempt; malformed requests are terminal.
pub(crate) fn is_transient(err: &AppError) -> bool {
    match err {
        AppError::AIClient(inner) => !matches!(
            inner,
            async_openai::error::OpenAIError::InvalidArgument(_)
        ),
        _ => false,
    }
}

/// Embedding implementation backed by an OpenAI-compatible endpoint.
pub struct OpenAiEmbedder<'a, C: Config> {
    client: &'a Client<C>,
    model: String,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl<'a, C: Config> OpenAiEmbedder<'a, C> {
    pub fn new(
        client: &'a Client<C>,
        model: String,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            model,
            limiter,
            retry,
        }
    }

    async fn embed_once(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        self.limiter.acquire().await;
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(texts.to_vec())
            .build()?;
        let response = self.client.embeddings().create(request).await?;

        if response.data.len() != texts.len() {
            return Err(AppError::EmbeddingShape(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                response.data.len()
            )));
        }
        // The API reports an index per item; order by it rather than
        // trusting response order.
        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

impl<'a, C: Config + Sync> Embedder for OpenAiEmbedder<'a, C> {
    fn embed<'e>(&'e self, texts: &'e [String]) -> BoxFuture<'e, AppResult<Vec<Vec<f32>>>> {
        async move {
            self.retry
                .run(|| self.embed_once(texts), is_transient)
                .await
        }
        .boxed()
    }
}

#[derive(Debug, Clone)]
pub struct EmbedConfig {
    /// Texts per remote call.
    pub batch_size: usize,
    /// Phase-progress rows are refreshed every this many batches.
    pub checkpoint_interval: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            checkpoint_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedSummary {
    pub candidates: usize,
    pub embedded: usize,
    pub failed: usize,
    pub batches: usize,
}

/// Run the embedding stage: fetch unprocessed rows, embed them batch by
/// batch, and persist each batch as soon as it succeeds. Rows that already
/// carry a successful embedding are skipped entirely, which is what makes an
/// interrupted run resumable.
#[tracing::instrument(name = "Generating embeddings", level = "info", skip(store, embedder))]
pub async fn run_embedding_stage(
    store: &Store,
    embedder: &dyn Embedder,
    config: &EmbedConfig,
) -> AppResult<EmbedSummary> {
    let candidates = store.embedding_candidates().await?;
    if candidates.is_empty() {
        info!("No rows awaiting embeddings");
        return Ok(EmbedSummary::default());
    }

    let batch_size = config.batch_size.max(1);
    let num_batches = candidates.len().div_ceil(batch_size);
    let phase_id = store
        .begin_phase(
            "embedding_generation",
            candidates.len() as i64,
            &json!({ "batch_size": batch_size }),
        )
        .await?;

    let header_span = info_span!("Embedding feedback...");
    header_span.pb_set_message("Embedding...");
    header_span.pb_set_finish_message("Embedding complete");
    header_span.pb_set_length(num_batches as u64);
    header_span.pb_set_style(
        &ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap(),
    );
    let header_span_enter = header_span.enter();

    let mut summary = EmbedSummary {
        candidates: candidates.len(),
        ..EmbedSummary::default()
    };
    // Dimension of the sentinel written for failed rows, learned from the
    // first successful batch.
    let mut known_dimension = 0usize;

    for (batch_idx, batch) in candidates.chunks(batch_size).enumerate() {
        let texts: Vec<String> = batch.iter().map(|row| row.feedback.clone()).collect();
        let submission_ids: Vec<i64> = batch.iter().map(|row| row.submission_id).collect();
        let start_idx = (batch_idx * batch_size) as i64;
        let end_idx = start_idx + batch.len() as i64;
        let started = Instant::now();

        match embedder.embed(&texts).await {
            Ok(vectors) => {
                known_dimension = vectors.first().map_or(known_dimension, Vec::len);
                let items: Vec<(i64, Vec<f32>)> =
                    submission_ids.iter().copied().zip(vectors).collect();
                store.store_embedded_batch(&items).await?;
                store
                    .record_batch(
                        batch_idx as i64,
                        start_idx,
                        end_idx,
                        ProcessingStatus::Completed,
                        0,
                        started.elapsed().as_secs_f64(),
                    )
                    .await?;
                summary.embedded += batch.len();
            }
            Err(err) => {
                warn!("Batch {} failed after retries. {}", batch_idx, err);
                store
                    .mark_batch_failed(&submission_ids, known_dimension, &err.to_string())
                    .await?;
                store
                    .record_batch(
                        batch_idx as i64,
                        start_idx,
                        end_idx,
                        ProcessingStatus::Failed,
                        batch.len() as i64,
                        started.elapsed().as_secs_f64(),
                    )
                    .await?;
                summary.failed += batch.len();
            }
        }

        summary.batches += 1;
        header_span.pb_inc(1);
        if batch_idx % config.checkpoint_interval.max(1) == 0 {
            store.update_phase_progress(phase_id, end_idx).await?;
        }
    }

    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);

    store
        .finish_phase(
            phase_id,
            (summary.embedded + summary.failed) as i64,
            summary.failed as i64,
        )
        .await?;
    info!(
        "Embedding stage finished: {} embedded, {} failed across {} batches",
        summary.embedded, summary.failed, summary.batches
    );
    Ok(summary)
}
