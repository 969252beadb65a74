use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use shh_sandbox::config::Config;
use shh_sandbox::models::UserIdentity;
use shh_sandbox::profile::build_profile;
use shh_sandbox::service::IdentityProvider;
use shh_sandbox::{
    console, provision, render, sandbox_path, Authenticator, IamClient, NetworkManager,
    SessionHandler, Supervisor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "shhd", author, version, about = "Sandboxed shell daemon tooling")]
struct Cli {
    /// Config file (defaults to shhd.yaml in /run/config or the working directory)
    #[arg(long, short = 'c', env = "SHHD_CONFIG_FILE")]
    config: Option<PathBuf>,
    /// Log level, overrides the config file
    #[arg(long = "log-level", short = 'l')]
    log_level: Option<String>,
    /// Also write daily rotated logs to this directory
    #[arg(long, env = "SHHD_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create device nodes, cgroup parents and the sandbox network
    Provision,
    /// Print the sandbox profile for a user
    Render(RenderArgs),
    /// Authenticate and run a sandboxed shell on this terminal
    Shell(ShellArgs),
    /// Print the effective configuration with secrets masked
    CheckConfig,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: u32,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = "")]
    command: String,
    /// Write the profile into the jail tmp dir and print its path instead
    #[arg(long)]
    write: bool,
}

#[derive(Args, Debug)]
struct ShellArgs {
    /// Login name; a `-ws` suffix requests a direct login
    #[arg(long, short = 'u')]
    user: String,
    /// Authenticate with this OpenSSH public key instead of a password
    #[arg(long, short = 'i')]
    identity: Option<PathBuf>,
    /// Skip host provisioning (already done by `shhd provision`)
    #[arg(long)]
    no_provision: bool,
    /// Command to run instead of an interactive shell
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref(), cli.log_level.as_deref())
        .context("failed to load configuration")?;
    let guard = init_tracing(&config.log_level, cli.log_dir.as_deref());

    config
        .read_secrets()
        .context("failed to read config secrets from files")?;
    tracing::debug!(
        "effective config: {}",
        serde_json::to_string(&config.redacted())?
    );

    match cli.command {
        Command::Provision => provision_host(&config).await?,
        Command::Render(args) => render_profile(&config, args).await?,
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
        Command::Shell(args) => {
            let status = run_shell(config, args).await?;
            drop(guard);
            // stdin may still be blocked in a reader thread
            std::process::exit(i32::try_from(status).unwrap_or(255));
        }
    }

    Ok(())
}

fn init_tracing(
    level: &str,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "shhd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn provision_host(config: &Config) -> anyhow::Result<()> {
    provision(&config.jail).context("failed to initialize shell jail")?;
    if config.jail.network.enabled() {
        NetworkManager::new()?
            .setup(&config.jail.network)
            .await
            .context("failed to set up sandbox network")?;
    }
    Ok(())
}

async fn render_profile(config: &Config, args: RenderArgs) -> anyhow::Result<()> {
    let user = UserIdentity {
        id: args.id,
        username: args.user,
        ssh_key: String::new(),
        renewed: Utc::now(),
    };
    let path_var = sandbox_path();

    if args.write {
        let file = render(&config.jail, &user, &args.token, &path_var, &args.command).await?;
        println!("{}", file.keep().display());
    } else {
        let profile = build_profile(
            &config.jail,
            &user,
            &args.token,
            &path_var,
            &args.command,
            "preview",
        )?;
        print!("{}", profile.to_text());
    }
    Ok(())
}

async fn run_shell(config: Config, args: ShellArgs) -> anyhow::Result<u32> {
    if !args.no_provision {
        provision_host(&config).await?;
    }

    let identity: Arc<dyn IdentityProvider> = Arc::new(IamClient::new(&config.iam)?);
    let authenticator = Authenticator::new(identity, config.iam.login_validity());
    let state = match &args.identity {
        Some(path) => {
            let key = ssh_key::PublicKey::read_openssh_file(path)
                .with_context(|| format!("failed to read public key {}", path.display()))?;
            authenticator.public_key(&args.user, &key).await?
        }
        None => {
            let prompt = format!("Password for {}", args.user);
            let password = tokio::task::spawn_blocking(move || {
                dialoguer::Password::new().with_prompt(prompt).interact()
            })
            .await??;
            authenticator.password(&args.user, &password).await?
        }
    };

    let supervisor = Supervisor::new(&config.jail.runtime)?;
    let handler = SessionHandler::new(Arc::new(config.jail.clone()), supervisor, sandbox_path());

    let (mut session, console) = console::open(&args.command.join(" "))?;
    let status = handler.handle(&state, &mut session).await;
    drop(console);
    Ok(status)
}
