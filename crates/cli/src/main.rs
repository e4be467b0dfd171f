//! CLI for the hmyload Harmony data loader.
//!
//! Every command prints JSON to stdout; progress goes to stderr via tracing.

use alloy_primitives::B256;
use clap::{Parser, Subcommand, ValueEnum};
use hmyload::{Address, CacheRegistry, Loader, LoaderOpts, Method};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "hmyload", version, about = "Cached Harmony transaction and token loader")]
struct Cli {
    /// WebSocket RPC endpoint.
    #[arg(short, long, env = "HMYLOAD_RPC_URL", default_value = "wss://ws.s0.t.hmny.io")]
    rpc_url: String,

    /// Cache directory. Defaults to `<user cache dir>/harmony-tk`.
    #[arg(long, env = "HMYLOAD_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Connections opened in addition to the default one.
    #[arg(short = 'n', long, default_value_t = 1)]
    additional_connections: usize,

    /// Per-call read timeout, in seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Load the whole cache into memory before running.
    #[arg(long, default_value_t = false)]
    preload: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load every transaction of a wallet.
    Wallet {
        /// `one1...` or `0x...` address.
        address: String,

        /// Resolve method signatures for the loaded transactions.
        #[arg(long, default_value_t = false)]
        methods: bool,
    },
    /// Load transactions by hash (either hash form).
    Tx {
        #[arg(required = true)]
        hashes: Vec<String>,

        #[arg(long, default_value_t = false)]
        methods: bool,
    },
    /// Read ERC-20 name, symbol and decimals.
    Tokens {
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Print the latest block number.
    BlockNumber,
    /// Inspect the local cache without connecting.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// List cached data.
    List {
        #[command(subcommand)]
        what: ListCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ListCommands {
    /// List cached method signatures.
    Methods {
        /// Only methods with a known name.
        #[arg(short, long, default_value_t = false)]
        known_only: bool,

        #[arg(short, long, value_enum, default_value_t = ListFormat::Pretty)]
        format: ListFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ListFormat {
    Pretty,
    Json,
    Signatures,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut opts = LoaderOpts::default()
        .with_additional_connections(cli.additional_connections)
        .with_rpc_timeout(Duration::from_secs(cli.timeout))
        .with_preload_cache(cli.preload);
    if let Some(dir) = &cli.cache_dir {
        opts = opts.with_cache_dir(dir.clone());
    }

    if let Commands::Cache { command } = &cli.command {
        return run_cache(command, &opts);
    }

    let t0 = Instant::now();
    let loader = Loader::connect(&cli.rpc_url, opts).await?;
    let result = run(&loader, cli.command).await;
    let closed = loader.close().await;
    tracing::info!(elapsed_ms = t0.elapsed().as_millis() as u64, "done");
    first_error(result, closed)
}

/// The command's own error wins; a close failure after it is only logged.
fn first_error(
    result: Result<(), Box<dyn std::error::Error>>,
    closed: Result<(), hmyload::LoadError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match (result, closed) {
        (Err(e), Err(close_err)) => {
            tracing::warn!(error = %close_err, "loader close failed");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), closed) => Ok(closed?),
    }
}

async fn run(loader: &Loader, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Wallet { address, methods } => {
            let address: Address = address.parse()?;
            let mut txs = loader.transactions_by_wallet(&address).await?;
            if methods {
                loader.methods(&mut txs).await?;
            }
            println!("{}", serde_json::to_string_pretty(&txs)?);
        }
        Commands::Tx { hashes, methods } => {
            let hashes = hashes
                .iter()
                .map(|h| h.parse::<B256>().map_err(|e| format!("invalid hash {h}: {e}")))
                .collect::<Result<Vec<_>, _>>()?;
            let mut txs = loader.full_transactions(&hashes).await?;
            if methods {
                let report = loader.methods(&mut txs).await?;
                if !report.unresolved.is_empty() {
                    tracing::warn!(unresolved = report.unresolved.len(), "some methods unresolved");
                }
            }
            println!("{}", serde_json::to_string_pretty(&txs)?);
        }
        Commands::Tokens { addresses } => {
            let addresses = addresses
                .iter()
                .map(|a| a.parse::<Address>())
                .collect::<Result<Vec<_>, _>>()?;
            let tokens = loader.tokens(&addresses).await?;
            println!("{}", serde_json::to_string_pretty(&tokens)?);
        }
        Commands::BlockNumber => {
            println!("{}", loader.block_number().await?);
        }
        Commands::Cache { .. } => return Err("cache commands run without a connection".into()),
    }
    Ok(())
}

fn run_cache(command: &CacheCommands, opts: &LoaderOpts) -> Result<(), Box<dyn std::error::Error>> {
    let CacheCommands::List {
        what: ListCommands::Methods { known_only, format },
    } = command;

    let registry = CacheRegistry::new();
    let cache = registry.open(&opts.resolve_cache_dir()?)?;
    let known_only = *known_only;
    let listed = cache.list_methods(|m| !known_only || !m.name.is_empty());
    let released = registry.release(&cache);
    let mut methods = listed?;
    released?;
    methods.sort_by(|a, b| a.name.cmp(&b.name));

    match format {
        ListFormat::Pretty => print!("{}", render_pretty(&methods)),
        ListFormat::Json => println!("{}", serde_json::to_string(&methods)?),
        ListFormat::Signatures => {
            for m in &methods {
                println!("{}", m.signature);
            }
        }
    }
    Ok(())
}

fn render_pretty(methods: &[Method]) -> String {
    let mut out = String::new();
    for m in methods {
        out.push_str(&format!(
            "\n{}:\n  Name:   {}\n  Params: [{}]\n",
            m.signature,
            m.name,
            m.parameters.join(" ")
        ));
    }
    out
}
