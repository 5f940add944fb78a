use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use plugin_router::{
    config::RouterConfig,
    loader::Loader,
    logger::init_tracing,
    plugin::{CmdRunnerFactory, Control},
    router::Router,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "router",
    about = "Spawns plugin executables and routes Service.Method calls to them",
    version
)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the router (default)
    Serve,

    /// Print the effective configuration as JSON and exit
    Config,
}

#[derive(Args, Debug)]
struct Settings {
    /// Address callers connect to
    #[arg(long, global = true)]
    addr: Option<SocketAddr>,

    /// Address of the registration service plugins call back
    #[arg(long, global = true)]
    registration_addr: Option<SocketAddr>,

    /// Directory holding plugin executables
    #[arg(long, global = true)]
    plugins_dir: Option<PathBuf>,

    /// Directory for router and plugin logs
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Seconds a plugin gets to complete registration
    #[arg(long, global = true)]
    handshake_timeout: Option<u64>,

    /// Do not watch the plugin directory for changes
    #[arg(long, global = true)]
    no_watch: bool,

    /// Environment file loaded before reading ROUTER_* variables
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,
}

impl Settings {
    fn apply(&self, config: &mut RouterConfig) {
        if let Some(addr) = self.addr {
            config.addr = addr;
        }
        if let Some(addr) = self.registration_addr {
            config.registration_addr = addr;
        }
        if let Some(dir) = &self.plugins_dir {
            config.plugins_dir = dir.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(secs) = self.handshake_timeout {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if self.no_watch {
            config.watch = false;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        RouterConfig::from_env(Some(&cli.settings.env_file)).context("loading configuration")?;
    cli.settings.apply(&mut config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Serve => {
            let env_file = Some(cli.settings.env_file).filter(|p| p.exists());
            serve(config, env_file).await
        }
    }
}

async fn serve(config: RouterConfig, env_file: Option<PathBuf>) -> anyhow::Result<()> {
    let _guard = init_tracing(&config.log_config())?;
    if let Some(path) = env_file {
        info!("loaded environment from {}", path.display());
    }
    for key in &config.unknown_vars {
        warn!("ignoring unknown setting {key}");
    }
    info!(
        addr = %config.addr,
        plugins_dir = %config.plugins_dir.display(),
        "starting router"
    );

    let runners = Arc::new(CmdRunnerFactory::new(config.log_dir.clone()));
    let control = Control::start(runners, config.control_options())
        .await
        .context("starting registration service")?;

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    info!(addr = %listener.local_addr()?, "router listening");
    let router = Arc::new(Router::new(control.clone()));
    let serving = tokio::spawn(router.serve(listener));

    std::fs::create_dir_all(&config.plugins_dir)
        .with_context(|| format!("creating {}", config.plugins_dir.display()))?;
    let loader = Loader::new(&config.plugins_dir)?;
    let loading = {
        let loader = loader.clone();
        let control = control.clone();
        tokio::spawn(async move { loader.load_all(&control).await })
    };
    let watcher = if config.watch {
        match loader.watch(control.clone()) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                error!("plugin directory watch disabled: {err}");
                None
            }
        }
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some(watcher) = watcher {
        watcher.shutdown();
    }
    loading.abort();
    serving.abort();
    control.shutdown().await;
    Ok(())
}
