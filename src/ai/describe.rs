use std::fmt::Write as _;
use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_openai::{Client, config::Config};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::style::ProgressStyle;

use crate::ai::extract_json;
use crate::embed::is_transient;
use crate::error::{AppError, AppResult};
use crate::retry::{RateLimiter, RetryPolicy};
use crate::store::{ClusterRow, Store};

static DESCRIBE_PROMPT: &str = std::include_str!("describe_prompt.txt");

/// Characters of each sample shown to the model.
const SAMPLE_TRUNCATE_CHARS: usize = 300;

/// Structured description returned by the model for one cluster.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ClusterDigest {
    /// Concise description of the cluster's main theme.
    pub theme: String,
    /// Key topics or concerns mentioned across the comments.
    pub key_topics: Vec<String>,
    /// General tone: positive, negative, neutral, or mixed.
    pub tone: String,
    /// What distinguishes this cluster from other feedback.
    pub distinguishing_features: Vec<String>,
    /// Actionable recommendations for program improvement.
    pub recommendations: Vec<String>,
}

impl ClusterDigest {
    /// Flatten the digest into the stored description text.
    pub fn render(&self) -> AppResult<String> {
        let mut out = String::new();
        writeln!(out, "{}", self.theme.trim())?;
        if !self.key_topics.is_empty() {
            writeln!(out, "Key topics: {}", self.key_topics.join(", "))?;
        }
        writeln!(out, "Tone: {}", self.tone.trim())?;
        if !self.distinguishing_features.is_empty() {
            writeln!(
                out,
                "Distinguishing features: {}",
                self.distinguishing_features.join("; ")
            )?;
        }
        for rec in &self.recommendations {
            writeln!(out, "Recommendation: {rec}")?;
        }
        Ok(out.trim_end().to_string())
    }
}

/// Trait for turning a cluster's sampled member texts into a description.
pub trait Describer: Send + Sync {
    fn describe<'a>(
        &'a self,
        cluster_id: i64,
        member_count: i64,
        samples: &'a [String],
    ) -> BoxFuture<'a, AppResult<String>>;
}

/// Describer backed by an OpenAI-compatible chat endpoint.
pub struct OpenAiDescriber<'a, C: Config> {
    client: &'a Client<C>,
    model: String,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl<'a, C: Config> OpenAiDescriber<'a, C> {
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

    async fn describe_once(
        &self,
        cluster_id: i64,
        member_count: i64,
        samples: &[String],
    ) -> AppResult<String> {
        self.limiter.acquire().await;

        let mut user = format!(
            "These are {member_count} feedback comments that share similar themes. \
             A sample of {}:\n\n",
            samples.len()
        );
        for (i, sample) in samples.iter().enumerate() {
            let shown: String = sample.chars().take(SAMPLE_TRUNCATE_CHARS).collect();
            writeln!(user, "{}. \"{shown}\"", i + 1)?;
        }

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(0.2)
            .response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: Some("Structured description of a feedback cluster".to_string()),
                    name: "cluster_digest".to_string(),
                    schema: Some(schema_for!(ClusterDigest).as_value().to_owned()),
                    strict: Some(true),
                },
            })
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(DESCRIBE_PROMPT)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| {
                AppError::Other(format!("empty completion for cluster {cluster_id}"))
            })?;
        debug!("Model response for cluster {cluster_id}: {content}");

        let payload = extract_json(&content).ok_or_else(|| {
            AppError::Other(format!("no JSON in completion for cluster {cluster_id}"))
        })?;
        let jd = &mut serde_json::Deserializer::from_str(payload);
        let digest: ClusterDigest = serde_path_to_error::deserialize(jd).map_err(|e| {
            warn!("Failed to parse digest at {}: {}", e.path(), e);
            AppError::SerdeJson(e.into_inner())
        })?;
        digest.render()
    }
}

impl<'a, C: Config + Sync> Describer for OpenAiDescriber<'a, C> {
    fn describe<'e>(
        &'e self,
        cluster_id: i64,
        member_count: i64,
        samples: &'e [String],
    ) -> BoxFuture<'e, AppResult<String>> {
        async move {
            self.retry
                .run(
                    || self.describe_once(cluster_id, member_count, samples),
                    is_transient,
                )
                .await
        }
        .boxed()
    }
}

#[derive(Debug, Clone)]
pub struct DescribeConfig {
    /// Member texts sampled per cluster.
    pub sample_cap: usize,
    /// Concurrent description workers.
    pub workers: usize,
    pub seed: u64,
}

impl Default for DescribeConfig {
    fn default() -> Self {
        Self {
            sample_cap: 20,
            workers: 5,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescribeSummary {
    pub described: usize,
    pub failed: usize,
}

/// Uniformly sample up to `cap` texts, preserving their relative order.
/// Never "first N": large clusters would otherwise be summarized from
/// whatever happened to be ingested first.
pub fn sample_texts(texts: &[String], cap: usize, seed: u64) -> Vec<String> {
    if texts.len() <= cap {
        return texts.to_vec();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picks: Vec<usize> = rand::seq::index::sample(&mut rng, texts.len(), cap).into_vec();
    picks.sort_unstable();
    picks.into_iter().map(|i| texts[i].clone()).collect()
}

async fn describe_one(
    store: &Store,
    describer: &dyn Describer,
    cluster: &ClusterRow,
    config: &DescribeConfig,
) -> AppResult<String> {
    let texts = store.cluster_member_texts(cluster.cluster_id).await?;
    if texts.is_empty() {
        return Err(AppError::DegenerateInput(format!(
            "cluster {} has no members to summarize",
            cluster.cluster_id
        )));
    }
    let samples = sample_texts(
        &texts,
        config.sample_cap,
        config.seed ^ cluster.cluster_id as u64,
    );
    describer
        .describe(cluster.cluster_id, texts.len() as i64, &samples)
        .await
}

/// Describe every materialized cluster with a bounded worker pool.
///
/// Clusters are independent: one failure is logged, stored as an explicit
/// placeholder, and never aborts its siblings. All store writes happen on
/// this task as results stream in.
#[tracing::instrument(name = "Describing clusters", level = "info", skip(store, describer))]
pub async fn run_describe_stage(
    store: &Store,
    describer: &dyn Describer,
    config: &DescribeConfig,
) -> AppResult<DescribeSummary> {
    let clusters = store.clusters_overview().await?;
    if clusters.is_empty() {
        info!("No clusters to describe");
        return Ok(DescribeSummary::default());
    }

    let phase_id = store
        .begin_phase(
            "cluster_description",
            clusters.len() as i64,
            &json!({ "sample_cap": config.sample_cap, "workers": config.workers }),
        )
        .await?;

    let header_span = info_span!("Describing clusters...");
    header_span.pb_set_message("Describing...");
    header_span.pb_set_finish_message("Descriptions complete");
    header_span.pb_set_length(clusters.len() as u64);
    header_span.pb_set_style(
        &ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap(),
    );
    let header_span_enter = header_span.enter();

    let mut results = futures::stream::iter(clusters.into_iter().map(|cluster| {
        let store = store.clone();
        async move {
            let outcome = describe_one(&store, describer, &cluster, config).await;
            (cluster, outcome)
        }
    }))
    .buffer_unordered(config.workers.max(1));

    let mut summary = DescribeSummary::default();
    while let Some((cluster, outcome)) = results.next().await {
        match outcome {
            Ok(description) => {
                store
                    .set_cluster_description(cluster.cluster_id, &description)
                    .await?;
                summary.described += 1;
            }
            Err(err) => {
                warn!("Cluster {} description failed. {}", cluster.cluster_id, err);
                let placeholder = format!(
                    "Cluster {} ({} members): description generation failed. {}",
                    cluster.cluster_id, cluster.size, err
                );
                store
                    .set_cluster_description(cluster.cluster_id, &placeholder)
                    .await?;
                summary.failed += 1;
            }
        }
        header_span.pb_inc(1);
        store
            .update_phase_progress(phase_id, (summary.described + summary.failed) as i64)
            .await?;
    }

    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);

    store
        .finish_phase(
            phase_id,
            (summary.described + summary.failed) as i64,
            summary.failed as i64,
        )
        .await?;
    info!(
        "Described {} clusters, {} failed",
        summary.described, summary.failed
    );
    Ok(summary)
}
