use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;
use unicity_cluster_registry::{
    AdministrationRegistry, DefinitionBundle, DefinitionCatalog, DeliveryTarget, NodeConfig,
    ReceiverDirectory, RouteTable, SurrealAdminStateStore, create_connection, ensure_schema,
};

#[derive(Parser)]
#[command(name = "cluster-registry")]
#[command(about = "Definition resolution and cluster administration registry")]
struct Cli {
    /// Path to registry.json (defaults to the standard locations)
    #[arg(short, long, global = true, env = "REGISTRY_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the administration REST server
    Server {
        /// Overrides `api.bind` from the config file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Initialize the database
    Init,
    /// Store every definition from a bundle file
    Import { file: PathBuf },
    /// Print the persisted redirection table
    ShowRedirections,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("unicity_cluster_registry=info".parse()?)
                .add_directive("surrealdb=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Server { bind } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            info!("Using database url for server: {}", config.database.url);

            let db = create_connection(config.database.clone()).await?;
            ensure_schema(&db).await?;

            let shutdown = CancellationToken::new();
            let directory = Arc::new(ReceiverDirectory::new());

            let mut registry = AdministrationRegistry::load(
                config.admin.instance_key.clone(),
                Arc::new(SurrealAdminStateStore::new(db.clone())),
                directory.clone(),
                config.admin.notification_timeout(),
            )
            .await?;

            // The local route table follows the registry through RouteChange
            // events. Its subscription is persisted, so only add it once.
            let route_target = DeliveryTarget::service(format!("route-table@{}", bind));
            let subscribed = registry
                .subscriptions()
                .subscriptions()
                .iter()
                .any(|s| s.target == route_target);
            if !subscribed {
                registry.subscribe_route_change(route_target.clone()).await?;
            }

            let (admin, admin_worker) = registry.spawn(config.admin.command_buffer, shutdown.clone());

            let routes = Arc::new(RouteTable::new(admin.clone()));
            routes.refresh(&shutdown)?;
            directory.register(route_target, routes.clone());
            info!("Route table mirrors {} rule(s)", routes.rule_count());

            let bootstrap = match &config.resolver.bootstrap_path {
                Some(path) => DefinitionBundle::from_file(path)?,
                None => DefinitionBundle::default(),
            };
            info!("Serving {} bootstrap definition(s)", bootstrap.len());

            let catalog = Arc::new(DefinitionCatalog::new(
                bootstrap,
                Some(&db),
                config.resolver.options(),
            ));
            let refresher = config
                .resolver
                .refresh_interval()
                .map(|period| catalog.clone().spawn_refresh(period, shutdown.clone()));

            let app = unicity_cluster_registry::api::create_admin_router(
                unicity_cluster_registry::api::AppState {
                    admin,
                    catalog,
                    shutdown: shutdown.clone(),
                },
            );

            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("binding {}", bind))?;
            info!("Admin server listening on http://{}", bind);

            let signal = shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Failed to listen for ctrl-c: {}", e);
                    }
                    info!("Shutting down");
                    signal.cancel();
                })
                .await?;

            shutdown.cancel();
            admin_worker.await?;
            if let Some(refresher) = refresher {
                refresher.await?;
            }
        }
        Commands::Init => {
            info!("Using database url for initialization: {}", config.database.url);

            info!("Initializing database...");
            let db = create_connection(config.database).await?;
            ensure_schema(&db).await?;
            info!("Database initialized successfully");
        }
        Commands::Import { file } => {
            let bundle = DefinitionBundle::from_file(&file)?;
            let db = create_connection(config.database).await?;
            ensure_schema(&db).await?;

            let written = bundle.import_into(&db).await?;
            println!("Imported {} definition(s) from {}", written, file.display());
        }
        Commands::ShowRedirections => {
            let db = create_connection(config.database).await?;
            ensure_schema(&db).await?;

            let registry = AdministrationRegistry::load(
                config.admin.instance_key.clone(),
                Arc::new(SurrealAdminStateStore::new(db)),
                Arc::new(ReceiverDirectory::new()),
                config.admin.notification_timeout(),
            )
            .await?;

            let Some(snapshot) = registry.get_snapshot(None) else {
                return Ok(());
            };
            if snapshot.rules.is_empty() {
                println!("No redirection rules (version {}).", snapshot.version);
                return Ok(());
            }

            println!("Version: {}", snapshot.version);
            println!("{:<38} {:<24} {:<32} {}", "ID", "SOURCE", "TARGET", "CONDITION");
            println!("{}", "-".repeat(110));
            for rule in snapshot.rules {
                let condition = rule
                    .condition
                    .map(|c| format!("{:?}", c))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<24} {:<32} {}",
                    rule.id.to_string(),
                    rule.source.as_str(),
                    rule.target.to_string(),
                    condition
                );
            }
        }
    }

    Ok(())
}
