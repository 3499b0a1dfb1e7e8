use clap::Parser;
use rdebug_core::relay::DEFAULT_NAMESPACE;
use rdebug_hub::{ws, Hub, HubConfig, LockRule, Registry};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:9080";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    log_dir: String,
    hub: HubConfig,
    attach: Option<(String, u16)>,
    session_name: String,
}

#[derive(Parser, Debug)]
#[command(name = "rdebug-hub", about = "Relay hub for ruby-debug-ide sessions")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    /// Lock a session name to a client id: `session-name=client-id`.
    #[arg(long = "lock")]
    locks: Vec<String>,
    /// Attach to an already running engine at `host:port` on startup.
    #[arg(long)]
    attach: Option<String>,
    #[arg(long, default_value = "default")]
    session_name: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            eprintln!("invalid_addr: {} ({err})", config.addr);
            return;
        }
    };
    let _log_sink = init_logging(&config, addr.port());

    let registry = Arc::new(Registry::new());
    let hub = Hub::new(config.hub.clone(), registry);

    if let Some((host, port)) = config.attach.clone() {
        let hub = hub.clone();
        let name = config.session_name.clone();
        tokio::spawn(async move {
            match hub.attach_engine(&host, port, &name).await {
                Ok(session_id) => info!(event = "engine_attached", session_id = %session_id),
                Err(err) => warn!(event = "engine_attach_failed", error = %err),
            }
        });
    }

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };
    info!(event = "hub_start", addr = %config.addr, namespace = %config.hub.namespace);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(err) = axum::serve(listener, ws::router(hub))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = resolve_addr(&args.addr);
    let debug = args.debug || env_flag("RDEBUG_HUB_DEBUG").unwrap_or(false);
    let log_dir = resolve_log_dir(&args.log_dir);
    let mut lock_rules = Vec::new();
    for raw in &args.locks {
        match LockRule::parse(raw) {
            Some(rule) => lock_rules.push(rule),
            None => eprintln!("ignoring invalid --lock value: {raw}"),
        }
    }
    let attach = args.attach.as_deref().and_then(parse_host_port);
    Config {
        addr,
        debug,
        log_dir,
        hub: HubConfig {
            namespace: args.namespace,
            queue_capacity: args.queue_capacity.max(1),
            write_timeout: Duration::from_secs(args.write_timeout),
            lock_rules,
            ..HubConfig::default()
        },
        attach,
        session_name: args.session_name,
    }
}

/// Log filter: `RUST_LOG` wins, then `--debug`, then `RDEBUG_LOG_LEVEL`.
fn log_filter(debug: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("RDEBUG_LOG_LEVEL")
            .ok()
            .filter(|level| !level.trim().is_empty())
            .unwrap_or_else(|| "info".to_string())
    };
    EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. The returned sink keeps the log file
/// open for the life of the process.
fn init_logging(config: &Config, port: u16) -> Option<LogSink> {
    let sink = match LogSink::open(&config.log_dir, port) {
        Ok(sink) => sink,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogSink::default()
        }
    };
    let file = sink.file.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(config.debug))
        .with_writer(BoxMakeWriter::new(move || TeeWriter::new(file.clone())))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(sink)
}

type SharedFile = Arc<Mutex<std::fs::File>>;

#[derive(Default)]
struct LogSink {
    file: Option<SharedFile>,
}

impl LogSink {
    /// Appends to `<log_dir>/rdebug-hub-<port>.log`, so hubs sharing a log
    /// directory keep separate files. No directory means stdout only.
    fn open(log_dir: &str, port: u16) -> io::Result<Self> {
        if log_dir.trim().is_empty() {
            return Ok(Self::default());
        }
        let dir = PathBuf::from(log_dir);
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(log_file_name(port)))?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }
}

fn log_file_name(port: u16) -> String {
    format!("rdebug-hub-{port}.log")
}

/// Copies every formatted record to stdout and the optional log file.
struct TeeWriter {
    stdout: io::Stdout,
    file: Option<SharedFile>,
}

impl TeeWriter {
    fn new(file: Option<SharedFile>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }

    fn with_file(&self, op: impl FnOnce(&mut std::fs::File) -> io::Result<()>) {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = op(&mut file);
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        self.with_file(|file| file.flush());
        Ok(())
    }
}

/// Reads a boolean env var. `None` when unset or not a recognised value.
fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("RDEBUG_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_ADDR.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    std::env::var("RDEBUG_LOG_DIR").unwrap_or_default()
}

fn parse_host_port(raw: &str) -> Option<(String, u16)> {
    let (host, port) = raw.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
