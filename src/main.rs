use std::path::{Path, PathBuf};
use std::sync::Arc;
use tierank::cache::{open_backend, VectorCache};
use tierank::cli::{CacheAction, Cli, Commands, ConfigAction};
use tierank::config::Config;
use tierank::document::{load_jsonl, Document};
use tierank::embedding::{provider_from_config, EmbeddingProvider};
use tierank::error::{Result, TierankError};
use tierank::pool::WorkerPool;
use tierank::ranking::{
    Embedder, ExhaustiveRanker, JsonLinesSink, PipelineAdapter, RankOptions, RankingStage,
    TierResult, TierScorer, TruncateStage,
};

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Rank {
            input,
            query,
            progressive,
            immediate_only,
            top,
        } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_rank(config, &input, query, progressive, immediate_only, top)?;
        }
        Commands::Cache { action } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_cache(&config, action)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, cli.profile, action)?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries ranking output
fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "tierank=debug" } else { "tierank=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| TierankError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })
}

fn cmd_rank(
    config: Config,
    input: &Path,
    query: String,
    progressive: bool,
    immediate_only: bool,
    top: Option<usize>,
) -> Result<()> {
    let documents = load_jsonl(input)?;
    tracing::info!("Loaded {} documents from {:?}", documents.len(), input);

    runtime()?.block_on(run_rank(
        config,
        documents,
        query,
        progressive || immediate_only,
        immediate_only,
        top,
    ))
}

async fn run_rank(
    config: Config,
    documents: Vec<Document>,
    query: String,
    progressive: bool,
    immediate_only: bool,
    top: Option<usize>,
) -> Result<()> {
    let provider = provider_from_config(&config.embedding)?;
    let query_vector = {
        let provider = provider.clone();
        tokio::task::spawn_blocking(move || provider.embed(&query))
            .await
            .map_err(|e| anyhow::anyhow!("query embedding task failed: {}", e))??
    };

    let cache = Arc::new(build_cache(&config, provider.as_ref())?);
    let pool = start_pool(&config, provider.clone()).await?;

    let embedder = Embedder::new(pool.clone(), provider, config.submit_timeout()?);
    let scorer = TierScorer::new(cache, embedder, config.tier_plan()?);
    let legacy = Arc::new(ExhaustiveRanker::from_scorer(&scorer));
    let stages: Vec<Arc<dyn RankingStage>> = top
        .map(|n| Arc::new(TruncateStage::new(n)) as Arc<dyn RankingStage>)
        .into_iter()
        .collect();
    let adapter = PipelineAdapter::new(scorer, legacy, stages);

    let options = RankOptions {
        progressive,
        immediate_only,
        ..Default::default()
    };
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling ranking");
            cancel.cancel();
        }
    });

    let ranked = if progressive {
        let mut sink = JsonLinesSink::new(std::io::stdout());
        match adapter
            .rank(documents, query_vector, options, &mut sink)
            .await
        {
            Ok(ranked) => sink.finish(&ranked).map(|_| ranked),
            Err(e) => Err(e),
        }
    } else {
        let mut unused: Vec<TierResult> = Vec::new();
        adapter
            .rank(documents, query_vector, options, &mut unused)
            .await
    };

    if let Some(pool) = &pool {
        pool.stop().await;
    }

    let ranked = ranked?;
    if !progressive {
        for doc in &ranked {
            let line = serde_json::to_string(doc).map_err(|e| TierankError::Json {
                source: e,
                context: "Failed to serialize ranked document".to_string(),
            })?;
            println!("{}", line);
        }
    }

    tracing::info!("Ranking finished with {} documents", ranked.len());
    Ok(())
}

fn build_cache(config: &Config, provider: &dyn EmbeddingProvider) -> Result<VectorCache> {
    let settings = config.cache_settings(provider.model_tag())?;
    if !config.cache.enabled {
        tracing::info!("Vector cache disabled");
        return Ok(VectorCache::disabled(settings));
    }

    match open_backend(&config.cache) {
        Ok(backend) => Ok(VectorCache::new(backend, settings)),
        Err(e) => {
            tracing::warn!("Vector cache unavailable, running uncached: {}", e);
            Ok(VectorCache::disabled(settings))
        }
    }
}

async fn start_pool(
    config: &Config,
    provider: Arc<dyn EmbeddingProvider>,
) -> Result<Option<Arc<WorkerPool>>> {
    if !config.pool.enabled {
        tracing::info!("Worker pool disabled, embedding synchronously");
        return Ok(None);
    }

    let pool = WorkerPool::start(provider, config.pool_settings()?)?;
    match pool.wait_ready(config.ready_timeout()?).await {
        Ok(_) => Ok(Some(Arc::new(pool))),
        Err(e) => {
            tracing::warn!("Worker pool not ready, embedding synchronously: {}", e);
            pool.stop().await;
            Ok(None)
        }
    }
}

fn cmd_cache(config: &Config, action: CacheAction) -> Result<()> {
    let backend = open_backend(&config.cache)?;

    match action {
        CacheAction::Stats => {
            println!("Vector cache");
            println!("============");
            println!("  Backend:   {}", backend.name());
            println!("  Namespace: {}", config.cache.namespace);
            println!("  TTL:       {}", config.cache.ttl);
            println!("  Entries:   {}", backend.len()?);
        }
        CacheAction::Purge => {
            let removed = backend.purge_expired()?;
            println!("✓ Removed {} expired entries", removed);
        }
    }

    Ok(())
}

fn cmd_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path, profile)?;
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
            println!("  Tiers: {}", config.ranking.tiers.len());
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'tierank config init' to create one."
        );
        return Config::default().resolve(profile.as_deref(), std::env::vars());
    }

    match profile {
        Some(profile) => Config::load_with_profile(&path, &profile),
        None => Config::load(&path),
    }
}
