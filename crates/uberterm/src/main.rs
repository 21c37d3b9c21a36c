//! Command-line client for gotty terminal sessions.

mod target;

use std::io::{BufRead as _, Write as _};
use std::os::fd::{AsFd as _, BorrowedFd};

use eyre::WrapErr as _;
use uberterm_client::{Client, ClientOptions, Credentials, Endpoint, ExitReason, terminal};
use uberterm_config::HostConfig;
use uberterm_protocol::{ResizeFormat, Revision};

use crate::target::Location;

const WINDOW_NAME_WORDS: usize = 2;

#[derive(clap::Parser)]
#[command(
    name = "uberterm",
    about = "Attach a local terminal to a remote gotty session"
)]
struct Args {
    /// Write debug logs to ~/.uberterm/logs
    #[arg(short = 'D', long, global = true, env = "UBERTERM_DEBUG")]
    debug: bool,

    /// Config file (defaults to ~/.config/uberterm/config.toml).
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(flatten)]
    connect: ConnectArgs,

    /// Server URL or host alias.
    target: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List sessions on the server.
    Sessions {
        /// Server URL or host alias.
        target: Option<String>,
    },
    /// Destroy a session by name.
    Destroy {
        name: String,
        /// Server URL or host alias.
        target: Option<String>,
    },
    /// List public instances.
    Instances,
}

#[derive(clap::Args)]
struct ConnectArgs {
    /// Skip TLS certificate verification.
    #[arg(
        long,
        global = true,
        env = "UBERTERM_SKIP_TLS_VERIFY",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    skip_tls_verify: Option<bool>,

    /// Use HTTP(S)_PROXY from the environment.
    #[arg(
        long,
        global = true,
        env = "UBERTERM_USE_PROXY_FROM_ENV",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    use_proxy_from_env: Option<bool>,

    /// Key sequence that detaches the client, e.g. "ctrl-p,ctrl-q".
    #[arg(long, global = true, env = "UBERTERM_DETACH_KEYS")]
    detach_keys: Option<String>,

    /// Protocol revision: v1 or v2.
    #[arg(long, global = true, env = "UBERTERM_PROTOCOL")]
    protocol: Option<Revision>,

    /// Resize frame layout: binary or json.
    #[arg(long, global = true, env = "UBERTERM_RESIZE_FORMAT")]
    resize_format: Option<ResizeFormat>,

    /// Websocket Origin header.
    #[arg(short, long, global = true, env = "UBERTERM_WS_ORIGIN")]
    ws_origin: Option<String>,

    /// Basic auth user.
    #[arg(short, long, global = true, env = "UBERTERM_USER")]
    user: Option<String>,

    /// Basic auth password (prompted for if a user is set without one).
    #[arg(short, long, global = true, env = "UBERTERM_PASSWORD")]
    password: Option<String>,

    /// Sent as the X-Admin-Password header.
    #[arg(short, long, global = true, env = "UBERTERM_ADMIN_PASSWORD")]
    admin_password: Option<String>,

    /// Session to attach to.
    #[arg(short, long, global = true, env = "UBERTERM_SESSION")]
    session: Option<String>,

    /// Look up the session by window name.
    #[arg(short = 'n', long, global = true, env = "UBERTERM_WINDOW")]
    window: Option<String>,

    /// Start a new session, optionally with this window name.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    new_session: Option<String>,

    /// Connect to an instance by callsign.
    #[arg(long, global = true, env = "UBERTERM_CALLSIGN")]
    callsign: Option<String>,

    /// Path appended to the server URL (default /terminal/).
    #[arg(long, global = true, env = "UBERTERM_PATH_SUFFIX")]
    path_suffix: Option<String>,

    /// Save these connection settings under an alias.
    #[arg(long)]
    save: Option<String>,
}

impl ConnectArgs {
    fn overrides(&self) -> HostConfig {
        HostConfig {
            url: None,
            callsign: self.callsign.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            admin_password: self.admin_password.clone(),
            skip_tls_verify: self.skip_tls_verify,
            use_proxy_from_env: self.use_proxy_from_env,
            ws_origin: self.ws_origin.clone(),
            protocol: self.protocol,
            path_suffix: self.path_suffix.clone(),
        }
    }
}

/// Everything needed to build a client, after config merge and lookups.
struct Prepared {
    endpoint: Endpoint,
    options: ClientOptions,
    /// What `--save` writes: the URL or callsign as given, not the resolved one.
    saved: HostConfig,
}

fn init_logging(debug: bool) -> eyre::Result<()> {
    if debug {
        let log_dir = dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".uberterm")
            .join("logs");
        std::fs::create_dir_all(&log_dir)?;

        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let log_path = log_dir.join(format!("{timestamp}.log"));
        let log_file = std::fs::File::create(&log_path)?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .init();

        eprintln!("debug log: {}", log_path.display());
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> uberterm_config::Config {
    let default_path = uberterm_config::config_path();
    let path = path.unwrap_or(&default_path);
    if path == default_path.as_path() {
        if let Err(e) = uberterm_config::ensure_exists(path) {
            tracing::debug!("could not create example config: {e}");
        }
    }
    uberterm_config::load_from(path).unwrap_or_else(|e| {
        tracing::warn!("failed to load config file: {e:#}");
        uberterm_config::Config::default()
    })
}

/// Read a line from the terminal with echo disabled.
fn prompt_password(user: &str) -> eyre::Result<String> {
    use nix::sys::termios::{LocalFlags, SetArg, tcgetattr, tcsetattr};

    eprint!("Password for {user}: ");
    std::io::stderr().flush()?;

    let stdin = std::io::stdin();
    let fd = stdin.as_fd();
    let original = tcgetattr(fd).wrap_err("stdin is not a terminal")?;
    let mut silent = original.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(fd, SetArg::TCSANOW, &silent)?;

    let mut line = String::new();
    let read = stdin.lock().read_line(&mut line);
    let _ = tcsetattr(fd, SetArg::TCSANOW, &original);
    eprintln!();

    read.wrap_err("failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn prepare(
    config: &uberterm_config::Config,
    target: Option<&str>,
    args: &ConnectArgs,
) -> eyre::Result<Prepared> {
    // `--new-session host` puts the target in the window-name slot.
    let (target, new_session) = match (target, args.new_session.as_deref()) {
        (None, Some(name)) if !name.is_empty() => (Some(name), Some(String::new())),
        (target, new_session) => (target, new_session.map(str::to_string)),
    };

    let resolved = target::resolve(config, target, &args.overrides())?;
    let host = resolved.host;

    let mut options = ClientOptions {
        credentials: Credentials {
            user: host.user.clone(),
            password: host.password.clone(),
            admin_password: host.admin_password.clone(),
        },
        ws_origin: host.ws_origin.clone(),
        skip_tls_verify: host.skip_tls_verify.unwrap_or(false),
        use_proxy_from_env: host.use_proxy_from_env.unwrap_or(false),
        revision: host.protocol.unwrap_or_default(),
        resize_format: args.resize_format.unwrap_or(config.resize_format),
        detach_keys: uberterm_config::parse_detach_keys(
            args.detach_keys.as_deref().unwrap_or(&config.detach_keys),
        ),
    };

    let mut saved = host.clone();
    let url = match &resolved.location {
        Location::Url(url) => {
            saved.url = Some(url.clone());
            saved.callsign = None;
            url.clone()
        }
        Location::Callsign(callsign) => {
            tracing::info!("looking up instance by callsign: {callsign}");
            let instance = uberterm_client::api::find_instance_by_callsign(callsign, &options)
                .await
                .wrap_err("failed to find instance")?;
            tracing::info!(
                "found instance '{}' at {}",
                instance.callsign,
                instance.public_url
            );
            saved.url = None;
            saved.callsign = Some(callsign.to_uppercase());
            instance.public_url
        }
    };
    // Only passwords given explicitly are persisted.
    saved.password.clone_from(&args.password);

    tracing::debug!(
        "user={:?} admin password set={} revision={}",
        options.credentials.user,
        options.credentials.admin_password.is_some(),
        options.revision
    );

    let suffix = host
        .path_suffix
        .as_deref()
        .unwrap_or(uberterm_config::DEFAULT_PATH_SUFFIX);
    let mut endpoint = Endpoint::parse(&url)?.with_path_suffix(suffix);
    options.credentials.fill_from(endpoint.userinfo());

    if options.credentials.user.is_some() && options.credentials.password.is_none() {
        let user = options.credentials.user.clone().unwrap_or_default();
        options.credentials.password = Some(prompt_password(&user)?);
    }

    let params = target::session_params(
        args.session.clone(),
        new_session,
        chrono::Utc::now().timestamp(),
        || human_id::gen_id(WINDOW_NAME_WORDS),
    );
    match params {
        Some(params) => {
            endpoint = endpoint.with_query_param("session", &params.session);
            if let Some(window) = &params.window {
                tracing::info!(
                    "creating session '{}' with window name '{window}'",
                    params.session
                );
                endpoint = endpoint.with_query_param("name", window);
            }
        }
        None => {
            if let Some(window) = &args.window {
                let lookup = Client::new(endpoint.clone(), options.clone());
                match lookup.find_session_by_window(window).await {
                    Ok(Some(session)) => {
                        tracing::info!(
                            "found session '{}' with window name '{window}'",
                            session.name
                        );
                        endpoint = endpoint.with_query_param("session", &session.name);
                    }
                    Ok(None) => tracing::warn!("no session found with window name '{window}'"),
                    Err(e) => tracing::warn!("failed to look up session by window name: {e}"),
                }
            }
        }
    }

    Ok(Prepared {
        endpoint,
        options,
        saved,
    })
}

/// Trigger shutdown on SIGTERM or SIGHUP.
fn forward_termination(shutdown: uberterm_client::Shutdown) -> eyre::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = hangup.recv() => {}
            () = shutdown.triggered() => return,
        }
        shutdown.trigger("signal", ExitReason::Requested);
    });
    Ok(())
}

async fn run_attach(
    config_path: &std::path::Path,
    config: &uberterm_config::Config,
    target: Option<&str>,
    args: &ConnectArgs,
) -> eyre::Result<()> {
    let prepared = prepare(config, target, args).await?;

    if let Some(alias) = &args.save {
        uberterm_config::save_host(config_path, alias, prepared.saved.clone())
            .wrap_err("failed to save config")?;
        eprintln!("saved connection settings as '{alias}' in {}", config_path.display());
    }

    let mut client = Client::new(prepared.endpoint, prepared.options);
    client
        .connect()
        .await
        .wrap_err_with(|| format!("failed to connect to {}", client.endpoint().base()))?;

    let stdin = std::io::stdin();
    let raw = match enter_raw_mode(stdin.as_fd()) {
        Ok(guard) => guard,
        Err(e) => {
            if let Err(close) = client.close().await {
                tracing::debug!("close failed: {close}");
            }
            return Err(e);
        }
    };
    forward_termination(client.exit_handle())?;

    let result = client.run().await;
    drop(raw);

    if let Err(e) = client.close().await {
        tracing::debug!("close failed: {e}");
    }

    match result? {
        ExitReason::Detached => eprintln!("\r\n\x1b[2m[detached]\x1b[0m"),
        ExitReason::ServerClosed => eprintln!("\r\n\x1b[2m[connection closed]\x1b[0m"),
        ExitReason::Requested => {}
    }
    Ok(())
}

fn enter_raw_mode(fd: BorrowedFd<'_>) -> eyre::Result<terminal::RawModeGuard<'_>> {
    terminal::RawModeGuard::enter(fd).wrap_err("stdin is not a terminal")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

async fn run_sessions(
    config: &uberterm_config::Config,
    target: Option<&str>,
    args: &ConnectArgs,
) -> eyre::Result<()> {
    let prepared = prepare(config, target, args).await?;
    let client = Client::new(prepared.endpoint, prepared.options);
    let list = client
        .list_sessions()
        .await
        .wrap_err("failed to list sessions")?;

    if list.sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!("Found {} session(s):\n", list.sessions.len());
    println!(
        "{:<30} {:<20} {:<8} {:<10} {:<20} LAST ACTIVE",
        "NAME", "WINDOW", "WINDOWS", "ATTACHED", "CREATED"
    );
    for session in list.sessions {
        let attached = if session.attached { "yes" } else { "no" };
        println!(
            "{:<30} {:<20} {:<8} {:<10} {:<20} {}",
            session.name,
            session.window_name,
            session.windows,
            attached,
            session.created,
            session.last_active
        );
    }
    Ok(())
}

async fn run_destroy(
    config: &uberterm_config::Config,
    name: &str,
    target: Option<&str>,
    args: &ConnectArgs,
) -> eyre::Result<()> {
    let prepared = prepare(config, target, args).await?;
    let client = Client::new(prepared.endpoint, prepared.options);
    client
        .destroy_session(name)
        .await
        .wrap_err("failed to destroy session")?;
    println!("Session '{name}' destroyed");
    Ok(())
}

async fn run_instances(args: &ConnectArgs) -> eyre::Result<()> {
    let options = ClientOptions {
        skip_tls_verify: args.skip_tls_verify.unwrap_or(false),
        use_proxy_from_env: args.use_proxy_from_env.unwrap_or(false),
        ..ClientOptions::default()
    };
    let list = uberterm_client::api::list_instances(&options)
        .await
        .wrap_err("failed to list instances")?;

    if list.instances.is_empty() {
        println!("No instances found.");
        return Ok(());
    }

    println!("Found {} instance(s):\n", list.instances.len());
    println!(
        "{:<15} {:<40} {:<30} {:<8} {:<8} URL",
        "CALLSIGN", "NAME", "LOCATION", "CLIENTS", "LOAD"
    );
    for instance in list.instances {
        println!(
            "{:<15} {:<40} {:<30} {:<8} {:<8} {}",
            instance.callsign,
            truncate(&instance.name, 40),
            truncate(&instance.location, 30),
            format!("{}/{}", instance.available_clients, instance.max_clients),
            instance.load_status,
            instance.public_url
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = <Args as clap::Parser>::parse();
    init_logging(args.debug)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(uberterm_config::config_path);
    let config = load_config(args.config.as_deref());

    match &args.command {
        None => run_attach(&config_path, &config, args.target.as_deref(), &args.connect).await,
        Some(Command::Sessions { target }) => {
            run_sessions(&config, target.as_deref(), &args.connect).await
        }
        Some(Command::Destroy { name, target }) => {
            run_destroy(&config, name, target.as_deref(), &args.connect).await
        }
        Some(Command::Instances) => run_instances(&args.connect).await,
    }
}
