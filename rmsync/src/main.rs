use std::io::Write as _;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{LevelFilter, debug, error, info};
use tokio_util::sync::CancellationToken;

use rmoci::{Auth, Client, HostConfig, HostMap, ManifestCache, RegClient, Throttle, TlsMode};
use rmsync::config::{Config, TlsSetting};
use rmsync::{sched, sync::Ctx, template};

/// Mirror container images between registries and OCI layouts.
#[derive(Parser, Debug)]
#[command(name = "rmsync", version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,

    /// log level: error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    verbosity: String,

    /// log options, e.g. `json` for line-delimited json events
    #[arg(long, global = true)]
    logopt: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// run continuously, syncing on each step's schedule
    Server {
        #[command(flatten)]
        opts: RunOpts,
    },
    /// run each step once and exit
    Once {
        #[command(flatten)]
        opts: RunOpts,
        /// only copy images the target does not have yet
        #[arg(long)]
        missing: bool,
    },
    /// dry run: report what would be copied
    Check {
        #[command(flatten)]
        opts: RunOpts,
    },
    /// print the parsed configuration
    Config {
        #[arg(short = 'c', long)]
        config: String,
    },
    /// print the version
    Version,
}

#[derive(clap::Args, Debug)]
struct RunOpts {
    /// config file, or `-` for stdin
    #[arg(short = 'c', long)]
    config: String,

    /// stop all steps after the first failure
    #[arg(long)]
    abort_on_error: bool,
}

fn setup_logs(verbosity: &str, json: bool) {
    let level = match verbosity {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    builder.filter_level(level);
    if json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "level": record.level().to_string().to_lowercase(),
                "msg": record.args().to_string(),
            });
            writeln!(buf, "{line}")
        });
    }
    builder.init();
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    let cfg = if path == "-" {
        Config::load(std::io::stdin().lock())?
    } else {
        Config::load(std::fs::File::open(path)?)?
    };
    Ok(cfg)
}

/// Credential entries become the remote driver's host table; user and pass
/// go through template expansion so secrets can come from env or files.
fn host_map(cfg: &Config) -> anyhow::Result<HostMap> {
    let mut hosts = HostMap::new();
    for cred in &cfg.creds {
        let auth = match (&cred.user, &cred.pass) {
            (Some(user), Some(pass)) => Auth::UserPass(
                template::expand(user, None, None)?,
                template::expand(pass, None, None)?,
            ),
            _ => Auth::Anonymous,
        };
        let tls = match cred.tls {
            Some(TlsSetting::Insecure) => TlsMode::Insecure,
            Some(TlsSetting::Disabled) => TlsMode::Disabled,
            _ => TlsMode::Enabled,
        };
        hosts.insert(cred.registry.clone(), HostConfig { auth, tls });
    }
    Ok(hosts)
}

fn build_ctx(cfg: &Config, abort_on_error: bool) -> anyhow::Result<Arc<Ctx>> {
    let mut reg = RegClient::builder().hosts(host_map(cfg)?);
    if let Some(ua) = &cfg.defaults.user_agent {
        reg = reg.user_agent(ua.clone());
    }
    if cfg.defaults.skip_docker_config != Some(true) {
        // docker credential helpers are not consulted; creds come from the
        // config document only
        debug!("docker config credentials are not supported, using config creds");
    }
    let client = Client::new(reg.build()?);
    let cache = ManifestCache::new(
        cfg.defaults.cache_count.unwrap_or(500),
        cfg.defaults.cache_time,
    );
    Ok(Arc::new(Ctx {
        client: Arc::new(client),
        throttle: Throttle::new(cfg.parallel()),
        cache,
        cancel: CancellationToken::new(),
        abort_on_error,
    }))
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let json = args.logopt.iter().any(|o| o == "json");
    setup_logs(&args.verbosity, json);

    let res = match args.cmd {
        Cmd::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Cmd::Config { config } => load_config(&config).and_then(|cfg| {
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }),
        Cmd::Once { opts, missing } => run(&opts, move |ctx, cfg| async move {
            sched::run_once(&ctx, &cfg, missing).await
        })
        .await,
        Cmd::Check { opts } => run(&opts, move |ctx, cfg| async move {
            sched::run_check(&ctx, &cfg).await
        })
        .await,
        Cmd::Server { opts } => run(&opts, move |ctx, cfg| async move {
            sched::run_server(&ctx, &cfg).await
        })
        .await,
    };

    match res {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run<F, Fut>(opts: &RunOpts, f: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<Ctx>, Arc<Config>) -> Fut,
    Fut: std::future::Future<Output = rmoci::Result<()>>,
{
    let cfg = Arc::new(load_config(&opts.config)?);
    let ctx = build_ctx(&cfg, opts.abort_on_error)?;
    spawn_signal_handler(ctx.cancel.clone());
    f(ctx, cfg).await?;
    Ok(())
}
