use std::{error::Error, path::PathBuf, process, sync::Arc};

use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, warn, LevelFilter};

use streamrelay::{
    config::Config,
    extractor::YtDlp,
    proxy::Proxy,
    resolver::Resolver,
    signal,
    store::TrackStore,
    track_id::TrackId,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// [default: config.toml in the user configuration directory]
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "STREAMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    ///
    /// Overrides `proxy.host` from the configuration file.
    #[arg(long, value_hint = ValueHint::Hostname)]
    host: Option<String>,

    /// Port to listen on
    ///
    /// Overrides `proxy.port` from the configuration file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum number of concurrent streams
    ///
    /// Overrides `proxy.max_concurrent_streams` from the configuration file.
    #[arg(long, value_name = "STREAMS")]
    max_streams: Option<usize>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Subcommand)]
enum Command {
    /// Run the streaming proxy (default)
    Serve,

    /// Resolve track ids and print their stream URLs
    Resolve {
        #[arg(required = true, value_name = "TRACK_ID")]
        track_ids: Vec<String>,
    },
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
        logger.filter_module("streamrelay", level);
    }

    logger.init();
}

/// Loads the configuration and applies command line overrides.
fn load_config(args: &Args) -> Result<Config, Box<dyn Error>> {
    let mut config = Config::load(args.config.as_deref())?;

    if let Some(host) = &args.host {
        config.proxy.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.proxy.port = port;
    }
    if let Some(max_streams) = args.max_streams {
        config.proxy.max_concurrent_streams = max_streams;
    }

    config.validate()?;
    Ok(config)
}

/// Runs the proxy until a shutdown signal arrives.
///
/// SIGHUP flushes the URL cache without stopping.
async fn serve(config: &Config, resolver: Arc<Resolver>) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(TrackStore::open(&config.store.path)?);
    info!(
        "track store at {} holds {} tracks",
        config.store.path.display(),
        store.len()?
    );

    let proxy = Proxy::new(&config.proxy, Arc::clone(&resolver), store)?;
    let listener = proxy.bind().await?;

    let signals = signal::Handler::new()?;
    let shutdown = async move {
        let signal = signals.shutdown(|| resolver.clear()).await;
        info!("received {signal}; shutting down gracefully");
    };

    proxy.serve(listener, shutdown).await?;
    Ok(())
}

/// Resolves `track_ids` and prints one `id url` line per success.
async fn resolve(resolver: &Resolver, track_ids: Vec<String>) -> Result<(), Box<dyn Error>> {
    for track_id in &track_ids {
        if !TrackId::is_valid(track_id) {
            warn!("{track_id} does not look like a track id");
        }
    }

    let urls = resolver.resolve_batch(track_ids.iter().cloned()).await;
    for track_id in &track_ids {
        if let Some(url) = urls.get(track_id) {
            println!("{track_id} {url}");
        }
    }

    if urls.is_empty() {
        return Err("no tracks could be resolved".into());
    }

    Ok(())
}

/// Main application logic.
///
/// # Errors
///
/// This function returns an error when the configuration is invalid, the
/// store cannot be opened, the listener cannot be bound, or nothing could be
/// resolved.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;
    debug!("{config:#?}");

    let extractor = YtDlp::new(
        &config.resolver.ytdlp_path,
        config.resolver.extract_timeout(),
    );
    let resolver = Arc::new(Resolver::new(
        Arc::new(extractor),
        config.resolver.options(),
    ));

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, resolver).await,
        Command::Resolve { track_ids } => resolve(&resolver, track_ids).await,
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and runs the selected command.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
