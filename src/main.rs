use anyhow::{Context, Result};
use clap::Parser;
use ldap_overlay_proxy::config::Config;
use ldap_overlay_proxy::server::LdapProxy;
use ldap_overlay_proxy::tls;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

#[derive(Parser)]
#[command(name = "ldap-overlay-proxy")]
#[command(about = "Transparent LDAP v3 proxy - filters, YAML attribute overlays and a search response cache")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Listen address (overrides config; e.g. 0.0.0.0:1389)
    #[arg(short = 'l', long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Load config from {:?}", args.config))?;
    if let Some(listen) = args.listen {
        config.config.listen = listen;
    }

    init_logging(&config, args.debug)?;
    info!("starting ldap-overlay-proxy");
    info!("  listen: {} (ssl: {})", config.config.listen, config.config.ssl);
    info!(
        "  upstream: {} (ssl: {})",
        config.config.upstream_addr(),
        config.config.upstream_ssl
    );
    info!(
        "  cache: {} (expire: {}s), overlay: {}",
        config.config.usecache, config.config.cacheexpire, config.config.yaml_attributes
    );

    let tls_acceptor = if config.config.ssl {
        let cert = config
            .config
            .ssl_cert
            .clone()
            .context("ssl enabled but ssl_cert unset")?;
        let key = config
            .config
            .ssl_key
            .clone()
            .context("ssl enabled but ssl_key unset")?;
        tls::validate_tls_files(&cert, &key)?;
        let server_config = tls::load_server_config(&cert, &key)?;
        info!("TLS enabled for listener");
        Some(TlsAcceptor::from(server_config))
    } else {
        None
    };

    let proxy = LdapProxy::new(config, Some(args.config), tls_acceptor)?;
    proxy.run().await
}

/// Wire the fmt subscriber to the configured sinks. Syslog transport is not
/// built in; log_syslog routes to the standard sink.
fn init_logging(config: &Config, debug_cli: bool) -> Result<()> {
    let d = &config.debug;
    // Category flags (pkt, net, cache, ...) emit at debug level; having any
    // of them on requires the debug floor.
    let verbose = d.pkt || d.pktsecure || d.net || d.cache || d.cache2 || d.filter;
    let default_level = if debug_cli || verbose {
        "debug"
    } else if d.info {
        "info"
    } else if d.warn {
        "warn"
    } else if d.err {
        "error"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("ldap_overlay_proxy={},info", default_level)));

    let writer = match &config.config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Open log file {:?}", path))?;
            if config.config.log_stderr || config.config.log_syslog {
                BoxMakeWriter::new(std::io::stderr.and(Mutex::new(file)))
            } else {
                BoxMakeWriter::new(Mutex::new(file))
            }
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .init();
    Ok(())
}
