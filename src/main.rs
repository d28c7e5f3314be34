mod config;
mod notify;
mod prompt;
mod provision;
mod relay;
mod signals;
mod transcript;
mod watchdog;
mod watcher;
mod workdir;

use clap::Parser;
use config::{Provider, RelayConfig};
use notify::{ConsoleNotifier, Notifier, Secret, SmtpNotifier, TransportSecurity};
use provision::CliProvisioner;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Run a tunnel CLI's device-code login and relay the code by email, so the
/// login can be finished from a browser anywhere.
///
/// The SMTP password is read from the environment (SMTP_PASSWORD by default),
/// never from the command line.
#[derive(Parser, Debug)]
#[command(name = "tunnel-login-relay", version, about)]
pub struct Cli {
    /// Config file path (optional; CLI flags override it)
    #[arg(short, long, default_value = "tunnel-relay.toml")]
    config: PathBuf,

    /// SMTP host for sending emails
    #[arg(long)]
    host: Option<String>,

    /// SMTP port for sending emails
    #[arg(long)]
    port: Option<u16>,

    /// SMTP username for authentication
    #[arg(long)]
    username: Option<String>,

    /// Use implicit TLS for the SMTP connection (usually port 465)
    #[arg(long)]
    use_ssl: bool,

    /// Upgrade the SMTP connection with STARTTLS (usually port 587)
    #[arg(long)]
    starttls: bool,

    /// Sender address (defaults to the username)
    #[arg(long)]
    from_addr: Option<String>,

    /// Recipient addresses
    #[arg(long, num_args = 1..)]
    to_addrs: Vec<String>,

    /// Prefix for email subjects
    #[arg(long)]
    subject_prefix: Option<String>,

    /// Tunnel name
    #[arg(long)]
    tunnel_name: Option<String>,

    /// Authentication provider
    #[arg(long, value_enum)]
    provider: Option<Provider>,

    /// Working directory for the CLI binary and transcript
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Give up on the login after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Transcript file (relative to the working directory)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Append to the transcript instead of overwriting it
    #[arg(long)]
    log_append: bool,

    /// Print the device code to stdout instead of emailing it
    #[arg(long)]
    print_only: bool,

    /// Send a notice when the relay starts, before the login begins
    #[arg(long)]
    notify_on_start: bool,

    /// Mail the last lines of login output if no device code is recognised
    #[arg(long)]
    send_output_on_miss: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (matcher decisions, SMTP setup)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Extra arguments passed to the login command
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    extra_args: Vec<String>,
}

/// Merge CLI flags over the config file. Flags that are not given leave the
/// file's values alone.
fn apply_overrides(config: &mut RelayConfig, cli: &Cli) {
    let smtp = &mut config.smtp;
    if let Some(host) = &cli.host {
        smtp.host = host.clone();
    }
    if let Some(port) = cli.port {
        smtp.port = port;
    }
    if let Some(username) = &cli.username {
        smtp.username = username.clone();
    }
    if let Some(from_addr) = &cli.from_addr {
        smtp.from_addr = from_addr.clone();
    }
    if !cli.to_addrs.is_empty() {
        smtp.to_addrs = cli.to_addrs.clone();
    }
    if let Some(prefix) = &cli.subject_prefix {
        smtp.subject_prefix = prefix.clone();
    }
    smtp.use_ssl |= cli.use_ssl;
    smtp.starttls |= cli.starttls;
    smtp.print_only |= cli.print_only;
    smtp.notify_on_start |= cli.notify_on_start;
    smtp.send_output_on_miss |= cli.send_output_on_miss;

    let tunnel = &mut config.tunnel;
    if let Some(name) = &cli.tunnel_name {
        tunnel.name = name.clone();
    }
    if let Some(provider) = cli.provider {
        tunnel.provider = provider;
    }
    if let Some(dir) = &cli.working_dir {
        tunnel.working_dir = dir.clone();
    }
    if !cli.extra_args.is_empty() {
        tunnel.extra_args = cli.extra_args.clone();
    }

    let watch = &mut config.watch;
    if cli.timeout.is_some() {
        watch.timeout_secs = cli.timeout;
    }
    if let Some(log_file) = &cli.log_file {
        watch.log_file = log_file.clone();
    }
    watch.log_append |= cli.log_append;
}

fn print_dry_run(config: &RelayConfig, config_path: &std::path::Path) {
    println!("tunnel-login-relay v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file: {}", config_path.display());
    println!("Working dir: {}", config.tunnel.working_dir.display());
    println!(
        "Command: {} {}",
        config.tunnel.working_dir.join(&config.provision.executable_name).display(),
        relay::build_args(&config.tunnel).join(" ")
    );
    if config.smtp.print_only {
        println!("Notifier: stdout");
    } else {
        println!(
            "Notifier: smtp {}:{} ({:?}) {} -> {}",
            config.smtp.host,
            config.smtp.port,
            TransportSecurity::from_config(&config.smtp),
            if config.smtp.from_addr.is_empty() {
                &config.smtp.username
            } else {
                &config.smtp.from_addr
            },
            config.smtp.to_addrs.join(", ")
        );
    }
    println!("Prompt patterns: {}", config.patterns.version);
    println!(
        "Output report on miss: {}",
        if config.smtp.send_output_on_miss { "on" } else { "off" }
    );
    match config.watch.timeout_secs {
        Some(secs) => println!("Timeout: {secs}s"),
        None => println!("Timeout: none"),
    }
    println!("Dry run mode: config validated, not running.");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("tunnel-login-relay starting");
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match RelayConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    apply_overrides(&mut config, &cli);
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    if cli.dry_run {
        print_dry_run(&config, &cli.config);
        return;
    }

    let notifier: Box<dyn Notifier> = if config.smtp.print_only {
        Box::new(ConsoleNotifier::new(config.smtp.subject_prefix.clone()))
    } else {
        let password = Secret::from_env(&config.smtp.password_env);
        match SmtpNotifier::new(&config.smtp, password) {
            Ok(n) => Box::new(n),
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
    };
    let fallback = ConsoleNotifier::new(config.smtp.subject_prefix.clone());
    let provisioner = CliProvisioner::new(&config.provision);

    match relay::run(
        &config,
        notifier.as_ref(),
        &fallback,
        &provisioner,
        signals::shutdown_signal(),
    )
    .await
    {
        Ok(report) => {
            tracing::info!(
                url = ?report.prompt.url,
                exit_code = ?report.exit_code,
                delivered_via = %report.delivered_via,
                lines = report.lines,
                duration_secs = report.duration.as_secs(),
                "login finished"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "relay failed");
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
