use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use runbox::config::CliArgs;
use runbox::database as db;
use runbox::queue::JobQueue;
use runbox::web_server::build_server;
use runbox::webhook::{RetryPolicy, WebhookDispatcher};
use runbox::worker::worker;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let db_path = db::get_db_path();
    let cli = CliArgs::parse();
    let config = Arc::new(cli.to_config().expect("Failed to load configuration"));

    if config.limits.max_concurrent_sandboxes == 0 {
        panic!("max_concurrent_sandboxes must not be 0");
    }

    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = Arc::new(
        db::init_db(&db_path)
            .await
            .expect("Failed to initialize database"),
    );
    let job_queue = Arc::new(JobQueue::new(config.limits.max_queue_size));
    let webhooks = Arc::new(WebhookDispatcher::new(
        RetryPolicy::new(config.limits.callback_max_attempts, Duration::from_secs(1)),
        config.features.enable_callbacks,
    ));
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=config.limits.max_concurrent_sandboxes {
        workers.spawn(worker(
            i,
            config.clone(),
            db_pool.clone(),
            job_queue.clone(),
            webhooks.clone(),
            shutdown_token.clone(),
        ));
    }

    let server =
        build_server(config, db_pool, job_queue).expect("Failed to build server");

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {res_server:?}");
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {res_worker:?}");
        }
    }

    // 1. Shutdown the HTTP server gracefully
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {e:?}");
            } else {
                log::error!("Worker handle finished with error: {e:?}");
            }
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
