use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use concread::cowcell::asynch::CowCell;
use holdfast::cache::QueryCache;
use holdfast::cli::build_cli;
use holdfast::config::{setup_logging, ConfigFile};
use holdfast::datastore::{self, LOG_QUEUE_DEPTH};
use holdfast::db;
use holdfast::filter::FilterEngine;
use holdfast::metrics::Metrics;
use holdfast::pipeline::QueryPipeline;
use holdfast::ratelimit::RateLimiter;
use holdfast::servers::{quic_server, tcp_server, tls_server, udp_server, Servers};
use holdfast::upstream::UpstreamManager;
use holdfast::{web, zonefile};
use tokio::sync::{broadcast, mpsc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn scheduler_error(err: impl std::fmt::Display) -> io::Error {
    io::Error::other(format!("scheduler setup failed: {err}"))
}

#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let matches = build_cli().get_matches();

    if matches.get_flag("exportconfig") {
        match ConfigFile::default().as_json_pretty() {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("{err}"),
        }
        return Ok(());
    }

    let config: CowCell<ConfigFile> =
        ConfigFile::try_as_cowcell(matches.get_one::<String>("config"))?;
    let _logger = setup_logging(config.read().await, &matches).await?;
    if let Err(err) = holdfast::logging::init_tracing(&config.read().await.log_level) {
        eprintln!("Failed to initialise tracing: {err}");
    }

    if let Err(errors) = ConfigFile::check_config(config.write().await).await {
        for error in &errors {
            error!("{error}");
        }
        return Err(io::Error::other(format!(
            "configuration check failed with {} error(s)",
            errors.len()
        )));
    }
    let config_read = config.read().await;
    info!("Starting with config: {}", *config_read);

    let pool = db::get_conn(&config_read).await?;
    db::start_db(&pool).await?;

    if matches.get_flag("configcheck") {
        println!("Configuration OK");
        return Ok(());
    }

    if let Some(filename) = matches.get_one::<String>("importzones") {
        let only_zone = matches.get_one::<String>("zone").map(String::as_str);
        let imported = zonefile::import_zone_file(&pool, filename, only_zone).await?;
        println!("Imported {imported} records");
        return Ok(());
    }

    if let Some(zone_name) = matches.get_one::<String>("exportzone") {
        let Some(mut zone) = db::zone::get_zone_by_name(&pool, zone_name).await? else {
            return Err(io::Error::other(format!("no zone named {zone_name}")));
        };
        if let Some(id) = zone.id {
            zone.records = db::zone::get_records_by_zone(&pool, id).await?;
        }
        println!("{}", zonefile::export_zone_json(&zone)?);
        return Ok(());
    }

    // a zone file in the config gets imported at startup
    if let Some(zone_file) = &config_read.zone_file {
        let imported = zonefile::import_zone_file(&pool, zone_file, None).await?;
        info!("Loaded {imported} records from {zone_file}");
    }

    let now = Utc::now().timestamp();

    let filter = Arc::new(FilterEngine::default());
    filter.reload(&pool).await?;

    let cache = Arc::new(QueryCache::new(pool.clone(), config_read.cache.clone()));
    if let Err(err) = cache.warm_from_mirror(now).await {
        error!("cache warm-up failed: {err}");
    }

    let upstreams = Arc::new(UpstreamManager::from_config(&config_read)?);
    let ratelimiter = Arc::new(RateLimiter::new(pool.clone(), config_read.rate_limit.clone()));
    let metrics = Arc::new(Metrics::new(now as u64));

    let (datastore_tx, datastore_rx) = mpsc::channel(LOG_QUEUE_DEPTH);
    let pipeline = Arc::new(QueryPipeline::new(
        (*config_read).clone(),
        pool.clone(),
        datastore_tx,
        filter,
        cache,
        upstreams,
        ratelimiter,
        metrics,
    ));

    // prefetch every five minutes, housekeeping every minute
    let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
    let prefetch_pipeline = pipeline.clone();
    scheduler
        .add(
            Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
                let pipeline = prefetch_pipeline.clone();
                Box::pin(async move {
                    match pipeline.prefetch_tick().await {
                        Ok(0) => {}
                        Ok(count) => info!("prefetch refreshed {count} cache entries"),
                        Err(err) => error!("prefetch pass failed: {err}"),
                    }
                })
            })
            .map_err(scheduler_error)?,
        )
        .await
        .map_err(scheduler_error)?;
    let maintenance_pipeline = pipeline.clone();
    scheduler
        .add(
            Job::new_async("30 * * * * *", move |_uuid, _lock| {
                let pipeline = maintenance_pipeline.clone();
                Box::pin(async move {
                    pipeline.maintenance_tick().await;
                })
            })
            .map_err(scheduler_error)?,
        )
        .await
        .map_err(scheduler_error)?;
    scheduler.start().await.map_err(scheduler_error)?;

    let cancel = CancellationToken::new();
    let (agent_tx, _) = broadcast::channel(10000);

    let mut servers = Servers::build(agent_tx.clone())
        .with_datastore(tokio::spawn(datastore::manager(datastore_rx, pool.clone())))
        .with_udpserver(tokio::spawn(udp_server(
            config.read().await,
            pipeline.clone(),
            cancel.clone(),
            agent_tx.clone(),
        )))
        .with_tcpserver(tokio::spawn(tcp_server(
            config.read().await,
            pipeline.clone(),
            cancel.clone(),
            agent_tx.clone(),
        )));

    if config_read.enable_tls {
        servers = servers.with_tlsserver(tokio::spawn(tls_server(
            config.read().await,
            pipeline.clone(),
            cancel.clone(),
            agent_tx.clone(),
        )));
    }
    if config_read.enable_quic {
        servers = servers.with_quicserver(tokio::spawn(quic_server(
            config.read().await,
            pipeline.clone(),
            cancel.clone(),
            agent_tx.clone(),
        )));
    }
    if config_read.enable_api {
        let apiserver = web::build(pipeline.clone(), config.read().await)
            .await
            .map_err(io::Error::from)?;
        servers = servers.with_apiserver(apiserver);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Got ctrl-c, shutting down");
                cancel.cancel();
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if servers.all_finished() {
                    error!("A server task exited, shutting down");
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    // give the listeners a moment to notice the cancellation
    tokio::time::sleep(Duration::from_millis(250)).await;
    Ok(())
}
