//! Command handlers and the session they share.

pub mod config_cmd;
pub mod list;
pub mod probe;
pub mod run;
pub mod show;

use std::path::PathBuf;

use portlet_config::Config;
use tracing::debug;
use portlet_core::{LifecycleManager, ServiceId, TcpProber};

use crate::cli::{Cli, Command, CompletionsArgs, GlobalOpts};
use crate::error::CliError;

/// Resolve the config path from `--config` / `PORTLET_CONFIG`.
pub fn config_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(portlet_config::config_path)
}

/// Loaded configuration plus a lifecycle manager with every configured
/// group and service registered.
pub struct Session {
    pub path: PathBuf,
    pub config: Config,
    pub manager: LifecycleManager<TcpProber>,
    /// Services marked `auto_connect`, in file order.
    pub auto_connect: Vec<ServiceId>,
}

impl Session {
    pub fn load(global: &GlobalOpts) -> Result<Self, CliError> {
        let path = config_path(global);
        let config = portlet_config::load_config_from(&path)?;

        let prober = TcpProber::with_targets(portlet_config::to_probe_targets(&config)?);
        let manager = LifecycleManager::new(portlet_config::to_lifecycle_config(&config), prober);
        let auto_connect = portlet_config::register_all(&config, &manager)?;
        debug!(path = %path.display(), services = config.service_count(), "session loaded");

        Ok(Self {
            path,
            config,
            manager,
            auto_connect,
        })
    }

    pub fn require_services(&self) -> Result<(), CliError> {
        if self.config.service_count() == 0 {
            return Err(CliError::NoServices {
                path: self.path.display().to_string(),
            });
        }
        Ok(())
    }
}

pub async fn dispatch(cmd: Command, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        // Config commands work without a valid config
        Command::Config(args) => config_cmd::handle(args, global),
        Command::Completions(args) => {
            completions(&args);
            Ok(())
        }
        Command::List(args) => list::handle(&Session::load(global)?, &args, global),
        Command::Show { id } => show::handle(&Session::load(global)?, &id, global),
        Command::Probe(args) => probe::handle(&Session::load(global)?, args, global).await,
        Command::Run(args) => run::handle(Session::load(global)?, args, global).await,
    }
}

/// Write shell completions to stdout.
pub fn completions(args: &CompletionsArgs) {
    use clap::CommandFactory;

    let mut cmd = Cli::command();
    clap_complete::generate(args.shell, &mut cmd, "portlet", &mut std::io::stdout());
}
