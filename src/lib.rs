// src/lib.rs

// --- Modules ---
pub mod cli;
pub mod config;
pub mod error;
pub mod generator;
pub mod key_pool;
pub mod retry;
pub mod runner;
pub mod tokenizer;

// --- Dependencies and re-exports ---
use crate::cli::{Cli, Commands};
use crate::generator::{ContentGenerator, GeminiClient, GenerationRequest};
use crate::key_pool::{preview_key, JobId, UsageStats};
use crate::runner::{JobOutcome, JobRunner, RunnerOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use key_pool::KeyPool;

/// Result of a `generate` run.
#[derive(Debug)]
pub struct GenerateReport {
    pub outcomes: Vec<JobOutcome>,
    pub written: Vec<PathBuf>,
    pub stats: UsageStats,
}

impl GenerateReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }
}

/// Picks the config path: explicit override, then `GEMINI_KEYPOOL_CONFIG`,
/// then `config.yaml` in the working directory.
pub fn resolve_config_path(config_path_override: Option<PathBuf>) -> PathBuf {
    config_path_override.unwrap_or_else(|| {
        std::env::var("GEMINI_KEYPOOL_CONFIG").map_or_else(|_| PathBuf::from("config.yaml"), PathBuf::from)
    })
}

/// Loads, validates and logs the application configuration.
pub fn setup_configuration(config_path_override: Option<PathBuf>) -> Result<(AppConfig, PathBuf)> {
    let config_path = resolve_config_path(config_path_override);

    let config_path_display = config_path.display().to_string();
    if config_path.exists() {
        info!(config.path = %config_path_display, "Using configuration file");
    } else {
        info!(config.path = %config_path_display, "Optional configuration file not found. Using defaults and environment variables.");
    }

    let app_config = config::load_config(&config_path).map_err(|e| {
        error!(
            config.path = %config_path_display,
            error = ?e,
            "Failed to load or validate configuration."
        );
        e
    })?;

    info!(
        model = %app_config.generator.model,
        quota_policy = ?app_config.pool.quota_policy,
        exclusive_leases = app_config.pool.exclusive_leases,
        max_concurrent_jobs = app_config.runner.max_concurrent_jobs,
        "Configuration loaded and validated successfully."
    );

    Ok((app_config, config_path))
}

/// Collects keys from every configured source and builds the pool.
pub fn build_key_pool(config: &AppConfig) -> Result<Arc<KeyPool>> {
    let raw_keys = config::collect_api_keys(config)?;
    let pool = KeyPool::new(raw_keys, config.pool_options())?;
    Ok(Arc::new(pool))
}

/// Runs one job per id with the same prompt and writes every successful
/// result to `output_dir/mock_test_{id}.txt`.
pub async fn generate_mock_tests(
    config: &AppConfig,
    pool: Arc<KeyPool>,
    generator: Arc<dyn ContentGenerator>,
    prompt: String,
    job_ids: Vec<JobId>,
    output_dir: &Path,
    cancel: CancellationToken,
) -> Result<GenerateReport> {
    let request = GenerationRequest {
        prompt,
        temperature: config.generator.temperature,
        max_output_tokens: config.generator.max_output_tokens,
    };
    let jobs = job_ids.into_iter().map(|job| (job, request.clone())).collect();

    let runner = Arc::new(JobRunner::new(
        Arc::clone(&pool),
        generator,
        RunnerOptions::from(config),
    ));
    let outcomes = runner.run_all(jobs, cancel).await;

    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| AppError::io("create_output_dir", &e))?;

    let mut written = Vec::new();
    for outcome in &outcomes {
        if let Ok(output) = &outcome.result {
            let path = output_dir.join(format!("mock_test_{}.txt", output.job_id));
            tokio::fs::write(&path, &output.text)
                .await
                .map_err(|e| AppError::io("write_mock_test", &e))?;
            written.push(path);
        }
    }

    Ok(GenerateReport {
        outcomes,
        written,
        stats: pool.stats(),
    })
}

/// Dispatches a parsed command line.
pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let run_id = Uuid::new_v4();
    let span = info_span!("run", run_id = %run_id);
    dispatch(cli, cancel).instrument(span).await
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<()> {
    match cli.command {
        Commands::Generate {
            prompt,
            count,
            start_at,
            output,
        } => {
            let (config, _) = setup_configuration(cli.config)?;
            let pool = build_key_pool(&config)?;
            let generator: Arc<dyn ContentGenerator> = Arc::new(GeminiClient::new(&config.generator)?);

            let prompt_text = tokio::fs::read_to_string(&prompt)
                .await
                .map_err(|e| AppError::io("read_prompt", &e))?;
            let job_ids = (start_at..start_at.saturating_add(count))
                .filter_map(JobId::new)
                .collect();
            let output_dir = output.unwrap_or_else(|| config.runner.output_dir.clone());

            let report =
                generate_mock_tests(&config, pool, generator, prompt_text, job_ids, &output_dir, cancel)
                    .await?;

            for outcome in &report.outcomes {
                match &outcome.result {
                    Ok(output) => println!(
                        "mock test {}: ok (key #{}, {} attempt(s), ~{} tokens)",
                        outcome.job_id, output.key_index, output.attempts, output.tokens
                    ),
                    Err(e) => println!("mock test {}: FAILED - {e}", outcome.job_id),
                }
            }
            println!("{}", report.stats);

            info!(written = report.written.len(), output = %output_dir.display(), "Generation finished");
            if report.failed() > 0 {
                warn!(failed = report.failed(), total = report.outcomes.len(), "Some jobs failed");
                return Err(AppError::GenerationIncomplete {
                    failed: report.failed(),
                    total: report.outcomes.len(),
                });
            }
            Ok(())
        }
        Commands::Keys { json } => {
            let (config, _) = setup_configuration(cli.config)?;
            let pool = build_key_pool(&config)?;
            let stats = pool.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{stats}");
            }
            Ok(())
        }
        Commands::Config { file, verbose } => {
            let (mut config, path) = setup_configuration(file.or(cli.config))?;
            println!("Configuration OK: {}", path.display());
            if verbose {
                config.keys.api_keys = config.keys.api_keys.iter().map(|k| preview_key(k.trim())).collect();
                print!("{}", serde_yaml::to_string(&config)?);
            }
            Ok(())
        }
    }
}
