//! Deploy key operator - mints GitLab deploy keys for Flux git Secrets

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deploy_key_operator::config::ControllerConfig;
use deploy_key_operator::controller::{run_workers, Context};
use deploy_key_operator::events::KubeEventPublisher;
use deploy_key_operator::gitlab::GitLabClient;
use deploy_key_operator::observer::ChangeObserver;
use deploy_key_operator::queue::WorkQueue;
use deploy_key_operator::retry::{default_controller_rate_limiter, RetryConfig};
use deploy_key_operator::signals;
use deploy_key_operator::store::{KubeSecretStore, LastKnownState};
use deploy_key_operator::{
    Error, CONTROLLER_NAME, DEFAULT_GITLAB_HOSTNAME, DEFAULT_WORKERS, SYNC_GC_MARK_LABEL,
};

/// Deploy key operator - registers Flux identities as GitLab deploy keys
#[derive(Parser, Debug)]
#[command(name = "deploy-key-operator", version, about, long_about = None)]
struct Cli {
    /// GitLab host serving the API and hosting the repositories
    #[arg(long, env = "GITLAB_HOSTNAME", default_value = DEFAULT_GITLAB_HOSTNAME)]
    gitlab_hostname: String,

    /// GitLab access token with permission to manage deploy keys
    #[arg(long, env = "GITLAB_TOKEN", hide_env_values = true)]
    gitlab_token: String,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Only watch Secrets in this namespace (default: all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Label selector for the Secrets to watch
    #[arg(long, default_value = SYNC_GC_MARK_LABEL)]
    label_selector: String,

    /// Delay before the first retry of a failed Secret, in milliseconds
    #[arg(long, default_value_t = 5)]
    retry_base_delay_ms: u64,

    /// Maximum per-Secret retry delay, in seconds
    #[arg(long, default_value_t = 1000)]
    retry_max_delay_secs: u64,

    /// Sustained retries per second across all Secrets
    #[arg(long, default_value_t = 10.0)]
    retry_qps: f64,

    /// Retries allowed in a burst before the rate limit applies
    #[arg(long, default_value_t = 100)]
    retry_burst: u32,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn into_config(self) -> ControllerConfig {
        ControllerConfig {
            gitlab_hostname: self.gitlab_hostname,
            gitlab_token: self.gitlab_token,
            workers: self.workers,
            namespace: self.namespace,
            label_selector: self.label_selector,
            retry: RetryConfig {
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_secs(self.retry_max_delay_secs),
                qps: self.retry_qps,
                burst: self.retry_burst,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Must happen before any TLS client (kube, reqwest) is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.into_config();
    config.validate()?;
    info!(?config, "starting deploy key operator");

    run(config).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let api: Api<Secret> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let (reader, writer) = reflector::store::<Secret>();

    let queue = WorkQueue::new("secrets", default_controller_rate_limiter(&config.retry));
    let last_known = LastKnownState::new();

    let registry = GitLabClient::new(&config.gitlab_hostname, config.gitlab_token.clone())?;
    let ctx = Arc::new(
        Context::builder(
            Arc::new(KubeSecretStore::new(client.clone(), reader.clone())),
            Arc::new(registry),
        )
        .events(Arc::new(KubeEventPublisher::new(
            client.clone(),
            CONTROLLER_NAME,
        )))
        .last_known(last_known.clone())
        .gitlab_hostname(config.gitlab_hostname.clone())
        .build(),
    );

    let shutdown = signals::shutdown_token()?;

    // The observer outlives the workers so the cache stays current while they drain
    let stream = watcher::watcher(api, watcher::Config::default().labels(&config.label_selector))
        .default_backoff();
    let observer = ChangeObserver::new(writer, queue.clone(), last_known);
    let stop_observer = CancellationToken::new();
    let observer_task = tokio::spawn(observer.run(stream, stop_observer.clone()));

    let cache_ready = async move {
        reader
            .wait_until_ready()
            .await
            .map_err(|e| Error::internal(format!("secret cache unavailable: {e}")))
    };
    run_workers(queue, ctx, config.workers, cache_ready, shutdown).await?;

    stop_observer.cancel();
    if let Err(e) = observer_task.await {
        warn!(error = %e, "change observer task failed");
    }
    info!("deploy key operator stopped");
    Ok(())
}
