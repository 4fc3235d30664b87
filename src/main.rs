//! Load run server - Main entry point.
//!
//! Starts the node: cluster directory, orchestrator and the peer HTTP API.

use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use loadrun_lib::api;
use loadrun_lib::auth::ClusterToken;
use loadrun_lib::cluster::{HttpStopForwarder, RunDirectory};
use loadrun_lib::config::Config;
use loadrun_lib::db::DbPool;
use loadrun_lib::engine::default_registry;
use loadrun_lib::jobs::JobRegistry;
use loadrun_lib::services::{self, DEFAULT_FIXTURE_COUNT, Orchestrator, ReaperConfig};
use loadrun_lib::store::{MemoryFileStore, MemoryLoadTestStore};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("");
            error!("Please check your environment variables:");
            error!("  - RUST_ENV must be set to 'development' or 'production'");
            error!("  - In production, a clustered node needs LOADRUN_CLUSTER_TOKEN");
            error!("  - In production, values must not match development defaults");
            std::process::exit(1);
        }
    };

    info!("========================================");
    info!("  Load Run Server");
    info!("  Environment: {}", config.environment);
    info!("  Node: {} ({})", config.node_id, config.advertise_url);
    info!("========================================");

    if config.is_development() {
        warn!("Running in DEVELOPMENT mode - do not use in production!");
    }

    tokio::fs::create_dir_all(&config.jmeter.work_dir).await?;

    // Cluster directory (optional)
    let pool = match config.database {
        Some(ref settings) => {
            let pool = DbPool::new(settings).await.map_err(std::io::Error::other)?;
            info!("Database connection established");
            pool.run_migrations().await.map_err(std::io::Error::other)?;
            Some(pool)
        }
        None => {
            info!("No LOADRUN_DATABASE_URL set, running single-node");
            None
        }
    };

    let cluster_token = ClusterToken::new(config.cluster_token.clone());

    let tests = Arc::new(MemoryLoadTestStore::new());
    let files = Arc::new(MemoryFileStore::new());
    let jobs = Arc::new(JobRegistry::new(
        config.runs.duplicate_runs,
        config.runs.finished_history,
    ));
    info!("Duplicate run policy: {}", config.runs.duplicate_runs);

    let mut builder = Orchestrator::builder(
        config.node_info(),
        tests.clone(),
        files,
        default_registry(config.jmeter.clone()),
    )
    .jobs(jobs)
    .settings(config.runs.orchestrator_settings());

    if let Some(ref pool) = pool {
        let directory: Arc<dyn RunDirectory> = Arc::new(pool.clone());

        services::reap_on_startup(directory.as_ref(), &config.node_id)
            .await
            .map_err(std::io::Error::other)?;

        services::start_reaper_task(
            Arc::clone(&directory),
            ReaperConfig {
                retention_hours: config.runs.record_retention_hours,
                interval_secs: config.reaper_interval_secs(),
            },
        );

        let forwarder = HttpStopForwarder::new(cluster_token.clone(), config.runs.forward_timeout())
            .map_err(std::io::Error::other)?;
        builder = builder.cluster(directory, Arc::new(forwarder));
        info!("Joined cluster directory as node {}", config.node_id);
    }

    let orchestrator = web::Data::new(builder.build());

    if config.seed_fixtures {
        match services::seed_demo_load_tests(
            tests.as_ref(),
            &config.fixture_projects,
            DEFAULT_FIXTURE_COUNT,
        )
        .await
        {
            Ok(seeded) => info!("Demo fixtures ready ({} inserted)", seeded),
            Err(e) => error!("Failed to seed demo fixtures: {}", e),
        }
    }

    let bind_address = config.bind_address();
    let worker_count = if config.is_development() {
        info!(
            "Starting server at http://{} (4 workers - development mode)",
            bind_address
        );
        4
    } else {
        let cpus = num_cpus::get();
        info!(
            "Starting server at http://{} ({} workers)",
            bind_address, cpus
        );
        cpus
    };

    let app_orchestrator = orchestrator.clone();
    let app_token = web::Data::new(cluster_token);
    let app_pool = pool.map(web::Data::new);

    let server = HttpServer::new(move || {
        let mut app = App::new()
            .app_data(app_orchestrator.clone())
            .app_data(app_token.clone());

        if let Some(ref pool) = app_pool {
            app = app.app_data(pool.clone());
        }

        app.service(
            web::scope("/api/v1")
                .configure(api::configure_health_routes)
                .configure(api::configure_openapi_routes)
                .configure(api::configure_cluster_routes),
        )
    })
    .workers(worker_count)
    .bind(&bind_address)?
    .run();

    let result = server.await;

    orchestrator.shutdown().await;
    info!("Server stopped");

    result
}
