//! SearchBridge sync daemon.
//!
//! Tails change streams and oplogs from the configured MongoDB clusters,
//! maps each mutation through its engine, and bulk-indexes the results
//! downstream. Exits 0 on a clean shutdown, 1 if any error was logged while
//! processing.

mod mappers;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bson::doc;
use clap::Parser;
use futures::future::join_all;
use mongodb::options::{ClientOptions, WriteConcern};
use mongodb::Client;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sb_common::redact_url;
use sb_config::{Cli, Config, NAME};
use sb_source::{
    chain_filters, inserts_and_updates_only, not_self_writes, only_namespaces, start_multi,
    OpFilter, ResumeSettings, ResumeStore, SourceOptions,
};
use sb_sync::{build_registry, DbClients, MapperRegistry, SyncManager, SyncSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // 1. Configuration; a missing engine table or unknown mapper is fatal
    let config = Config::load(cli)?;
    let mut mapper_registry = MapperRegistry::new();
    mappers::register_all(&mut mapper_registry);
    let registry = build_registry(&config.engines, &mapper_registry)?;

    if config.pprof {
        warn!("pprof profiling endpoints are not available in this build");
    }

    // 2. Dial the database clients; a SIGINT during dialing aborts
    let dials = dial_all(&config);
    let (core, learn, engagement, test) = tokio::select! {
        result = dials => result?,
        _ = signal::ctrl_c() => anyhow::bail!("interrupted while connecting"),
    };

    // 3. Resume point
    let resume_store = ResumeStore::new(core.clone(), NAME, &config.resume_name);
    let resume_point = resume_store
        .load(ResumeSettings {
            replay: config.replay,
            resume: config.resume,
            resume_from_timestamp: config.resume_from_timestamp,
            strategy: config.resume_strategy,
        })
        .await?;

    // 4. Indexer client
    let indexer = Arc::new(
        sb_index::IndexerClient::new(sb_index::IndexerConfig {
            base_url: config.app_search_url.clone(),
            api_key: (!config.app_search_api_key.is_empty())
                .then(|| config.app_search_api_key.clone()),
            user_agent: config.user_agent(),
            ..sb_index::IndexerConfig::default()
        })?,
    );

    // 5. Op source with the default filter chain
    let filter = build_filter(&config);
    let direct_read_namespaces = config.direct_read_ns_list();
    let mut source = start_multi(
        source_clients(&config, [&core, &learn, &engagement, &test]),
        SourceOptions {
            channel_size: config.source_settings.channel_size,
            buffer_size: config.source_settings.buffer_size,
            buffer_duration: config.source_settings.buffer_duration()?,
            oplog_disabled: !direct_read_namespaces.is_empty(),
            direct_read_namespaces,
            change_stream_namespaces: config.change_stream_ns_list(),
            oplog_database: config
                .oplog_database
                .clone()
                .unwrap_or_else(|| "local".to_string()),
            oplog_collection: config
                .oplog_collection
                .clone()
                .unwrap_or_else(|| "oplog.rs".to_string()),
            filter: Some(filter),
            resume: resume_point,
            ..SourceOptions::default()
        },
    );
    let stop = source.stop_handle();
    let direct_reads = source.direct_reads.take();
    let ops = source.ops;
    let errors = source.errors;

    // 6. Supervisor: workers, error consumer, periodic flusher
    let manager = Arc::new(SyncManager::new(
        registry,
        indexer,
        DbClients {
            core: core.clone(),
            learn,
            engagement,
            test,
        },
        Some(resume_store.clone()),
        SyncSettings {
            flush_buffer_size: config.flush_buffer_size,
            resume: config.resume,
            resume_strategy: config.resume_strategy,
            verbose: config.verbose,
        },
        config.stats,
    ));

    let error_consumer = manager.spawn_error_consumer(errors);
    let workers = manager.spawn_workers(config.app_search_clients, ops);

    let flusher = (config.flush_interval > 0).then(|| {
        manager.spawn_flusher(Duration::from_secs(config.flush_interval as u64))
    });

    // 7. Post-direct-read checkpoint and optional exit
    if let Some(direct_reads) = direct_reads {
        let store = resume_store.clone();
        let stop = stop.clone();
        let resume = config.resume;
        let timestamp_mode = config.resume_strategy == sb_config::ResumeStrategy::Timestamp;
        let exit_after = config.exit_after_direct_reads;
        tokio::spawn(async move {
            let _ = direct_reads.await;
            if resume && timestamp_mode {
                match store.last_committed().await {
                    Ok(ts) => {
                        if let Err(e) = store.save_timestamp(ts).await {
                            error!("{}", e);
                        }
                    }
                    Err(e) => error!("{}", e),
                }
            }
            if exit_after {
                stop.stop();
            }
        });
    }

    // 8. Diagnostic HTTP server
    let server = if config.enable_http_server {
        let addr = config.http_addr()?;
        let ctx = sb_api::DiagContext::new(manager.clone(), config.stats);
        Some(tokio::spawn(async move {
            if let Err(e) = sb_api::serve(addr, ctx).await {
                error!("Unable to serve http: {}", e);
            }
        }))
    } else {
        None
    };

    info!("{} started", NAME);

    // 9. Run until the op stream drains or a signal arrives
    let mut workers_done = join_all(workers);
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Stopping all workers and shutting down");
            stop.stop();
            (&mut workers_done).await;
        }
        _ = &mut workers_done => {
            info!("Op stream drained, shutting down");
        }
    }

    // workers already flushed and checkpointed on stream closure; one last
    // sweep catches anything the error consumer raced in
    if let Err(e) = manager.batch_index().await {
        error!("{}", e);
    }

    if let Some(flusher) = flusher {
        flusher.abort();
    }
    if let Some(server) = server {
        server.abort();
    }
    error_consumer.abort();

    if manager.is_tainted() {
        std::process::exit(1);
    }
    Ok(())
}

/// Dials all four logical databases concurrently. A failed ping is fatal.
async fn dial_all(config: &Config) -> Result<(Client, Client, Client, Client)> {
    let relax = config.resume && config.resume_write_unsafe;
    tokio::try_join!(
        dial(&config.core_mongo_url, relax),
        dial(&config.learn_mongo_url, relax),
        dial(&config.engagement_mongo_url, relax),
        dial(&config.test_mongo_url, relax),
    )
}

async fn dial(url: &str, relax_writes: bool) -> Result<Client> {
    let mut options = ClientOptions::parse(url)
        .await
        .with_context(|| format!("unable to parse MongoDB URL {}", redact_url(url)))?;
    options.app_name = Some(NAME.to_string());
    options.server_selection_timeout = Some(Duration::from_secs(1));
    options.connect_timeout = Some(Duration::from_secs(1));
    if relax_writes {
        options.write_concern = Some(WriteConcern::builder().journal(false).build());
    }

    let client = Client::with_options(options)?;
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await
        .with_context(|| format!("unable to connect to MongoDB using URL {}", redact_url(url)))?;
    info!("Connected to {}", redact_url(url));
    Ok(client)
}

/// The clients the source consumes from, deduplicated by connection URL so
/// shared clusters are tailed once.
fn source_clients(config: &Config, clients: [&Client; 4]) -> Vec<Client> {
    let urls = [
        &config.core_mongo_url,
        &config.learn_mongo_url,
        &config.engagement_mongo_url,
        &config.test_mongo_url,
    ];
    let mut seen = HashSet::new();
    urls.iter()
        .zip(clients)
        .filter(|(url, _)| seen.insert(url.as_str()))
        .map(|(_, client)| client.clone())
        .collect()
}

fn build_filter(config: &Config) -> OpFilter {
    let mut filters = vec![not_self_writes(NAME)];
    if !config.change_streams {
        let registered: HashSet<String> =
            config.engines.iter().map(|e| e.namespace.clone()).collect();
        filters.push(only_namespaces(registered));
    }
    if !config.index_deletes {
        filters.push(inserts_and_updates_only());
    }
    chain_filters(filters)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
