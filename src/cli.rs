use std::fmt::Display;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use clap::builder::styling::{AnsiColor, Color, Style, Styles};
use clap::{ArgAction, Args, ColorChoice, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::{Generator, Shell, generate};
use clap_complete_nushell::Nushell;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::info;

use crate::ai::describe::{DescribeConfig, OpenAiDescriber};
use crate::cluster::{SearchConfig, StrategyKind};
use crate::embed::{EmbedConfig, OpenAiEmbedder};
use crate::monitor::MonitorConfig;
use crate::pipeline::ClusterStageOptions;
use crate::retry::{RateLimiter, RetryPolicy};
use crate::store::Store;
use crate::{AppResult, ai, ingest, monitor, pipeline, report};

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .error(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red))))
    .literal(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Green))),
    )
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
    .valid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
    .invalid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightRed))))
    .context(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Magenta))))
    .context_value(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
    );

/// Long-form CLI description shown in `--help`.
const LONG_ABOUT: &str = "Feedback Atlas - Cluster and summarize program feedback

The pipeline runs in stages, each persisting into a shared SQLite database:
- ingest: load a CSV export of feedback submissions
- embed: generate text embeddings via an OpenAI-compatible server
- cluster: project the embeddings and group them
- describe: summarize each cluster with a language model
- report: render HTML/Markdown/JSON artifacts

Every stage resumes from the stored state, so an interrupted run can simply
be invoked again. `monitor` watches progress from a separate process.";

/// Feedback Atlas - Cluster and summarize program feedback.
#[derive(Parser, Debug, Clone)]
#[command(author, version, propagate_version = true, about, long_about = Some(LONG_ABOUT), styles = STYLES)]
pub struct Cli {
    /// Color choice for the output
    #[arg(long, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Subcommand to run
    #[command(subcommand)]
    pub cmd: Cmd,
}

/// Top-level commands, one per pipeline stage.
#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Load a CSV export of feedback submissions into the database
    ///
    /// Rows are upserted on submission_id; re-ingesting the same export is
    /// harmless. Submissions at or below the length threshold are skipped.
    Ingest {
        /// CSV file produced by the upstream exporter
        input: PathBuf,
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Generate embeddings for every submission that does not have one yet
    Embed {
        #[command(flatten)]
        embed: EmbedArgs,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Cluster the embedded submissions and store assignments
    Cluster {
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Summarize each cluster with the generation model
    Describe {
        #[command(flatten)]
        describe: DescribeArgs,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Render charts, markdown, and JSON payloads from the stored results
    Report {
        #[command(flatten)]
        report: ReportArgs,
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Watch pipeline progress from a separate process (read-only)
    Monitor {
        /// Refresh interval, e.g. "5s" or "1m"
        #[arg(long, default_value = "5s")]
        interval: String,

        /// Print a single snapshot and exit
        #[arg(long, default_value_t = false, action = ArgAction::SetTrue)]
        once: bool,

        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Run the full pipeline: [ingest,] embed, cluster, describe, report
    Run {
        /// Optional CSV export to ingest before the pipeline stages
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[command(flatten)]
        embed: EmbedArgs,
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        describe: DescribeArgs,
        #[command(flatten)]
        report: ReportArgs,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Generate shell completion for a given shell
    Completion {
        /// Output file to write the completion script to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The shell to generate the completion for
        #[arg(value_enum)]
        shell: CompletionShell,

        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },
}

/// Supported completion targets for shell auto-completion.
#[derive(ValueEnum, Clone, Debug)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
    Nushell,
}

impl Display for CompletionShell {
    /// Render the canonical shell name string.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionShell::Bash => "bash",
            CompletionShell::Zsh => "zsh",
            CompletionShell::Fish => "fish",
            CompletionShell::PowerShell => "powershell",
            CompletionShell::Elvish => "elvish",
            CompletionShell::Nushell => "nushell",
        };
        write!(f, "{}", s)
    }
}

impl Generator for &CompletionShell {
    fn generate(&self, cmd: &clap::builder::Command, buf: &mut dyn Write) {
        match self {
            CompletionShell::Bash => Shell::Bash.generate(cmd, buf),
            CompletionShell::Zsh => Shell::Zsh.generate(cmd, buf),
            CompletionShell::Fish => Shell::Fish.generate(cmd, buf),
            CompletionShell::PowerShell => Shell::PowerShell.generate(cmd, buf),
            CompletionShell::Elvish => Shell::Elvish.generate(cmd, buf),
            CompletionShell::Nushell => Nushell.generate(cmd, buf),
        }
    }

    fn file_name(&self, name: &str) -> String {
        match self {
            CompletionShell::Bash => Shell::Bash.file_name(name),
            CompletionShell::Zsh => Shell::Zsh.file_name(name),
            CompletionShell::Fish => Shell::Fish.file_name(name),
            CompletionShell::PowerShell => Shell::PowerShell.file_name(name),
            CompletionShell::Elvish => Shell::Elvish.file_name(name),
            CompletionShell::Nushell => Nushell.file_name(name),
        }
    }
}

/// Options locating the analysis database.
#[derive(Args, Debug, Clone)]
pub struct DbArgs {
    /// Path to the analysis database
    /// Defaults to the data directory (see --help output of the tool)
    #[arg(long)]
    pub db: Option<PathBuf>,
}

impl DbArgs {
    pub async fn open_store(&self) -> AppResult<Store> {
        let path = match &self.db {
            Some(path) => path.clone(),
            None => feedback_atlas_dirs::default_db_path()?,
        };
        Store::open(path).await
    }
}

/// Options for the model server shared by the embed and describe stages.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Whether to use secure connection (HTTPS) to the model server
    /// Defaults to false for local servers (i.e. `localhost` and private subnets)
    /// Defaults to true for public IP addresses and hostnames
    /// Note: This is not a flag. You must provide a value (true or false) if you use this option.
    #[arg(long)]
    pub secure: Option<bool>,

    /// Host for the model server
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port for the model server
    #[arg(long, default_value_t = 1234)]
    pub port: u16,

    /// OpenAI API version for the model server
    ///
    /// Defaults to "v1" (the standard OpenAI API version)
    #[arg(long, default_value = "v1")]
    pub api_version: String,

    /// API key for the model server
    ///
    /// Falls back to the FEEDBACK_ATLAS_API_KEY environment variable;
    /// local servers usually need neither
    #[arg(long)]
    pub api_key: Option<String>,

    /// Model used for text embeddings
    #[arg(long, default_value = "text-embedding-nomic-embed-text-v1.5")]
    pub embedding_model: String,

    /// Model used for cluster descriptions
    #[arg(long, default_value = "openai/gpt-oss-20b")]
    pub generation_model: String,

    /// Requests-per-second ceiling shared across all remote calls
    #[arg(long, default_value_t = 20.0)]
    pub requests_per_second: f64,

    /// Remote call attempts before a batch or cluster is marked failed
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,
}

impl ModelArgs {
    pub fn get_client(&self) -> Client<OpenAIConfig> {
        let api_key = self
            .api_key
            .clone()
            .or_else(|| std::env::var("FEEDBACK_ATLAS_API_KEY").ok());
        ai::build_client(
            &self.host,
            self.port,
            &self.api_version,
            self.secure,
            api_key.as_deref(),
        )
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::per_second(self.requests_per_second))
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(1))
    }
}

/// Options controlling the embedding stage.
#[derive(Args, Debug, Clone)]
pub struct EmbedArgs {
    /// Texts per embedding request
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,
}

impl EmbedArgs {
    pub fn config(&self) -> EmbedConfig {
        EmbedConfig {
            batch_size: self.batch_size,
            ..EmbedConfig::default()
        }
    }
}

/// Clustering strategy selectable on the command line.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum StrategyChoice {
    /// Density-based grouping; sparse points stay unassigned
    Density,
    /// Fixed-k centroids; every point is assigned
    Centroid,
}

impl From<StrategyChoice> for StrategyKind {
    fn from(choice: StrategyChoice) -> Self {
        match choice {
            StrategyChoice::Density => StrategyKind::Density,
            StrategyChoice::Centroid => StrategyKind::Centroid,
        }
    }
}

/// Options controlling the clustering stage.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Clustering strategy to sweep
    #[arg(long, value_enum, default_value_t = StrategyChoice::Density)]
    pub strategy: StrategyChoice,

    /// Smallest acceptable number of clusters
    #[arg(long, default_value_t = 4)]
    pub min_k: usize,

    /// Largest acceptable number of clusters
    #[arg(long, default_value_t = 10)]
    pub max_k: usize,

    /// Minimum-cluster-size candidates swept by the density strategy
    #[arg(long, value_delimiter = ',', default_values_t = [15, 30, 50, 100, 200])]
    pub density_grid: Vec<usize>,

    /// Cluster selection epsilon for the density strategy
    #[arg(long, default_value_t = 0.0)]
    pub epsilon: f64,

    /// Components of the projection used for clustering
    #[arg(long, default_value_t = 50)]
    pub dims: usize,

    /// Random seed for reproducible runs
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl ClusterArgs {
    pub fn options(&self) -> ClusterStageOptions {
        ClusterStageOptions {
            kind: self.strategy.into(),
            search: SearchConfig {
                min_k: self.min_k,
                max_k: self.max_k,
                density_grid: self.density_grid.clone(),
                epsilon: self.epsilon,
                seed: self.seed,
                ..SearchConfig::default()
            },
            cluster_dims: self.dims,
        }
    }
}

/// Options controlling the describe stage.
#[derive(Args, Debug, Clone)]
pub struct DescribeArgs {
    /// Member texts sampled per cluster
    #[arg(long, default_value_t = 20)]
    pub sample_cap: usize,

    /// Concurrent description workers
    #[arg(long, default_value_t = 5)]
    pub workers: usize,

    /// Random seed for representative sampling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl DescribeArgs {
    pub fn config(&self) -> DescribeConfig {
        DescribeConfig {
            sample_cap: self.sample_cap,
            workers: self.workers,
            seed: self.seed,
        }
    }
}

/// Options controlling report output.
#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    /// Directory for the rendered artifacts
    /// Defaults to the reports directory under the data directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl ReportArgs {
    pub fn out_dir(&self) -> AppResult<PathBuf> {
        Ok(match &self.output {
            Some(path) => path.clone(),
            None => feedback_atlas_dirs::default_reports_dir()?,
        })
    }
}

/// Helper trait for accessing verbosity flags on commands.
pub trait GetVerbosity {
    fn get_verbosity(&self) -> &Verbosity<InfoLevel>;
}

impl GetVerbosity for Cmd {
    fn get_verbosity(&self) -> &Verbosity<InfoLevel> {
        match self {
            Cmd::Ingest { verbosity, .. } => verbosity,
            Cmd::Embed { verbosity, .. } => verbosity,
            Cmd::Cluster { verbosity, .. } => verbosity,
            Cmd::Describe { verbosity, .. } => verbosity,
            Cmd::Report { verbosity, .. } => verbosity,
            Cmd::Monitor { verbosity, .. } => verbosity,
            Cmd::Run { verbosity, .. } => verbosity,
            Cmd::Completion { verbosity, .. } => verbosity,
        }
    }
}

impl Cmd {
    /// Execute the chosen top-level command.
    #[tracing::instrument(name = "Running command", level = "info", skip(self))]
    pub async fn run(&self) -> AppResult<()> {
        match self {
            Cmd::Ingest { input, db, .. } => {
                let store = db.open_store().await?;
                let summary = ingest::run_ingest(&store, input).await?;
                info!(
                    "Ingest complete: {} rows, {} skipped as too short",
                    summary.ingested, summary.skipped_short
                );
                Ok(())
            }
            Cmd::Embed {
                embed, model, db, ..
            } => {
                let store = db.open_store().await?;
                let client = model.get_client();
                let embedder = OpenAiEmbedder::new(
                    &client,
                    model.embedding_model.clone(),
                    model.limiter(),
                    model.retry(),
                );
                let summary =
                    crate::embed::run_embedding_stage(&store, &embedder, &embed.config()).await?;
                info!(
                    "Embed complete: {} embedded, {} failed",
                    summary.embedded, summary.failed
                );
                Ok(())
            }
            Cmd::Cluster { cluster, db, .. } => {
                let store = db.open_store().await?;
                let summary = pipeline::run_cluster_stage(&store, &cluster.options()).await?;
                info!(
                    "Cluster complete: {} clusters via {}, {} noise",
                    summary.n_clusters, summary.method, summary.noise
                );
                Ok(())
            }
            Cmd::Describe {
                describe, model, db, ..
            } => {
                let store = db.open_store().await?;
                let client = model.get_client();
                let describer = OpenAiDescriber::new(
                    &client,
                    model.generation_model.clone(),
                    model.limiter(),
                    model.retry(),
                );
                let summary =
                    crate::ai::describe::run_describe_stage(&store, &describer, &describe.config())
                        .await?;
                info!(
                    "Describe complete: {} described, {} failed",
                    summary.described, summary.failed
                );
                Ok(())
            }
            Cmd::Report { report, db, .. } => {
                let store = db.open_store().await?;
                let summary = report::run_report_stage(&store, report.out_dir()?).await?;
                info!("Report complete: {} files", summary.files.len());
                Ok(())
            }
            Cmd::Monitor {
                interval,
                once,
                db,
                ..
            } => {
                let store = db.open_store().await?;
                let config = MonitorConfig {
                    interval: humantime::parse_duration(interval)?,
                    once: *once,
                };
                monitor::run_monitor(&store, &config).await
            }
            Cmd::Run {
                input,
                embed,
                cluster,
                describe,
                report,
                model,
                db,
                ..
            } => {
                let store = db.open_store().await?;
                if let Some(input) = input {
                    ingest::run_ingest(&store, input).await?;
                }
                let client = model.get_client();
                // One rate limiter for both stages: they share the remote
                // call budget of a single server.
                let limiter = model.limiter();
                let embedder = OpenAiEmbedder::new(
                    &client,
                    model.embedding_model.clone(),
                    Arc::clone(&limiter),
                    model.retry(),
                );
                let describer = OpenAiDescriber::new(
                    &client,
                    model.generation_model.clone(),
                    limiter,
                    model.retry(),
                );
                pipeline::run_full_pipeline(
                    &store,
                    &embedder,
                    &describer,
                    &embed.config(),
                    &cluster.options(),
                    &describe.config(),
                    &report.out_dir()?,
                )
                .await
            }
            Cmd::Completion { shell, output, .. } => {
                let mut cmd = Cli::command();
                if let Some(output_path) = output {
                    let mut file = std::fs::OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .create(true)
                        .open(output_path)?;
                    // Write completion script to the requested file.
                    generate(shell, &mut cmd, "feedback-atlas", &mut file);
                    info!(
                        "Generated completion script for {} at {}",
                        shell,
                        output_path.display()
                    );
                } else {
                    // Fallback: print completion script to stdout.
                    generate(shell, &mut cmd, "feedback-atlas", &mut std::io::stdout());
                }
                Ok(())
            }
        }
    }
}
