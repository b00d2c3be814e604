use smtp_graph_relay::config::{self, RelayConfig};
use smtp_graph_relay::utils::NO_PEER;
use smtp_graph_relay::{tls, GraphClient, Logger, SmtpRelay};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

/// How long the process stays up after writing a configuration template
const TEMPLATE_EXIT_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-graph-relay",
    about = "Relays inbound SMTP mail through the Microsoft Graph sendMail API"
)]
pub struct Opt {
    /// Configuration file (key=value lines)
    #[structopt(short = "c", long = "config", default_value = ".env", parse(from_os_str))]
    pub config: PathBuf,

    /// Listening port, overrides SMTP_PORT
    #[structopt(short = "p", long = "port")]
    pub port: Option<u16>,

    /// Listening address (default: 0.0.0.0)
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - log every SMTP line
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Print peer-supplied text without escaping - DANGEROUS
    #[structopt(short = "r", long = "raw")]
    pub raw_display: bool,

    /// TLS certificate file, enables STARTTLS
    #[structopt(long = "tls-cert", parse(from_os_str), requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PKCS#8)
    #[structopt(long = "tls-key", parse(from_os_str), requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => eprintln!("[INFO] SIGTERM received. Closing server."),
                _ = tokio::signal::ctrl_c() => eprintln!("[INFO] Ctrl+C received. Closing server."),
            }
        }
        Err(e) => {
            eprintln!("[WARNING] Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("[INFO] Ctrl+C received. Closing server.");
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
    eprintln!("[INFO] Ctrl+C received. Closing server.");
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    if config::provision_template(&opt.config)? {
        eprintln!(
            "[ERROR] {:?} not found. A template was written; update it with your actual values.",
            opt.config
        );
        eprintln!("[INFO] Exiting in {} seconds", TEMPLATE_EXIT_DELAY.as_secs());
        tokio::time::sleep(TEMPLATE_EXIT_DELAY).await;
        std::process::exit(1);
    }

    let config = match RelayConfig::load(&opt.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            std::process::exit(1);
        }
    };

    let logger = Logger::new(opt.log_file.clone(), opt.verbose, opt.raw_display)?;

    for entry in config.allow_list.invalid_entries() {
        logger
            .error(&NO_PEER, &format!("Ignoring malformed ALLOWED_IPS entry: {:?}", entry))
            .await;
    }
    if config.allow_list.is_empty() {
        logger
            .log(&NO_PEER, "ALLOWED_IPS is empty: accepting connections from any address")
            .await;
    }

    let api = Arc::new(GraphClient::new(config.credentials.clone()));
    let mut relay = SmtpRelay::new(&config, api, logger.clone());

    if let (Some(cert), Some(key)) = (&opt.tls_cert, &opt.tls_key) {
        relay = relay.with_tls(tls::load_acceptor(cert, key)?);
        logger
            .log(&NO_PEER, &format!("STARTTLS enabled with certificate: {:?}", cert))
            .await;
    }

    let relay = Arc::new(relay);
    let port = opt.port.unwrap_or(config.port);

    println!("[INFO] PID: {}", std::process::id());
    println!("[INFO] Sending as: {}", relay.identity());
    println!("[INFO] Allow-list entries: {}", config.allow_list.len());
    println!("[INFO] Max message size: {} bytes", config.max_message_size);

    let mut server = tokio::spawn(relay.clone().run(opt.address.clone(), port));

    tokio::select! {
        result = &mut server => return result?,
        _ = termination_signal() => relay.shutdown(),
    }

    server.await?
}
