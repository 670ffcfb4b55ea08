use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harbor::config::{Config, ConfigError};
use harbor::protocol::message::QueryResult;
use harbor::utils::{format_bytes, format_duration, mask_secret};
use harbor::{Driver, Execute};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "A MySQL/MariaDB client driver with load-balanced pooling and host failover")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Harbor Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one statement against a service and print the result
    Query {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/harbor.toml")]
        config: PathBuf,
        /// Service name from the configuration
        #[arg(short, long, default_value = "default")]
        service: String,
        /// SQL statement
        sql: String,
    },
    /// Open a connection to a service and ping it
    Ping {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/harbor.toml")]
        config: PathBuf,
        /// Service name from the configuration
        #[arg(short, long, default_value = "default")]
        service: String,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Query {
            config,
            service,
            sql,
        } => run_query(config, &service, &sql).await?,
        Commands::Ping { config, service } => run_ping(config, &service).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

fn connect_driver(config_path: &Path) -> Result<Driver> {
    let config = Config::load_from_file(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config)?;
    info!("Configuration loaded from: {:?}", config_path);
    Ok(Driver::new(config)?)
}

async fn run_query(config_path: PathBuf, service: &str, sql: &str) -> Result<()> {
    let driver = connect_driver(&config_path)?;
    let mut conn = driver
        .get_connection(service)
        .await
        .with_context(|| format!("Failed to connect to service '{}'", service))?;

    let start = Instant::now();
    let result = conn.query(sql).await;
    let elapsed = start.elapsed();
    drop(conn);
    driver.close().await;

    print_result(&result?);
    println!("({})", format_duration(elapsed));
    Ok(())
}

fn print_result(result: &QueryResult) {
    if result.columns.is_empty() {
        println!(
            "OK, {} rows affected, last insert id {}, {} warnings",
            result.affected_rows, result.last_insert_id, result.warnings
        );
        return;
    }

    let header: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
    println!("{}", header.join("\t"));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join("\t"));
    }
    println!("{} rows", result.rows.len());
}

async fn run_ping(config_path: PathBuf, service: &str) -> Result<()> {
    let driver = connect_driver(&config_path)?;

    let start = Instant::now();
    let mut conn = driver
        .get_connection(service)
        .await
        .with_context(|| format!("Failed to connect to service '{}'", service))?;
    conn.ping().await?;
    let elapsed = start.elapsed();

    let pooled = conn.inner();
    println!(
        "✓ {} (server {}, connection id {}) answered in {}",
        pooled.host(),
        pooled.server_version(),
        pooled.connection_id(),
        format_duration(elapsed)
    );
    if let Some(state) = driver.pool(service)?.manager().global_state() {
        println!(
            "  max_allowed_packet: {}",
            format_bytes(state.max_allowed_packet)
        );
        println!("  wait_timeout: {}", format_duration(state.wait_timeout));
        println!("  isolation level: {}", state.isolation_level);
    }

    drop(conn);
    driver.close().await;
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  harbor ping --config {:?} --service orders", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  User: {}", config.driver.user);
            if let Some(password) = &config.driver.password {
                println!("  Password: {}", mask_secret(password));
            }
            let pool = config.pool_options();
            println!(
                "  Pool size: {}..{}, max idle {}",
                pool.min_pool_size,
                pool.max_pool_size,
                format_duration(pool.max_idle_time)
            );

            for service in &config.services {
                println!(
                    "  Service {}: {} groups, {}, retry_all_downs {}",
                    service.name,
                    service.groups.len(),
                    service.group_strategy,
                    service.retry_all_downs
                );
                for (i, group) in service.groups.iter().enumerate() {
                    println!("    group {} ({}):", i + 1, group.strategy);
                    for host in &group.hosts {
                        println!("      {}", host);
                    }
                }
                println!("    blacklist: {}", service.blacklist);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("harbor v{}", env!("CARGO_PKG_VERSION"));
    println!("A MySQL/MariaDB client driver with load-balanced pooling and host failover");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • mysql_native_password, caching_sha2_password, client_ed25519 authentication");
    println!("  • Random, Rotation and ServerAffinity host selection with group failover");
    println!("  • Host blacklist with timeout recovery");
    println!("  • Bounded async connection pool with idle validation and reaping");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let json = config.logging.format == "json";

    let mut layers = Vec::new();
    if config.logging.stdout {
        let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
        layers.push(if json {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }
    if let Some(path) = &config.logging.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path))?;
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false);
        layers.push(if json {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    tracing_subscriber::registry()
        .with(layers.with_filter(filter))
        .try_init()
        .context("Failed to initialize logging")?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
