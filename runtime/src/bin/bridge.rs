use std::{env, net::SocketAddr, path::PathBuf, process, sync::Arc};

use anyhow::{Context, Result};
use nanobot_mcp::config::{ServerConfig, Settings, load_settings};
use nanobot_mcp::logging::{LoggerCfg, SqlitePublisher, TracingPublisher};
use nanobot_mcp::{
    HttpServer, HttpServerOptions, PersistentSessionStore, Proxy, ProxyHandler, RpcEventPublisher,
    SessionOptions, SqliteStateStore, StdioServer, start_http_server,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = parse_args().unwrap_or_else(|err| {
        eprintln!("error: {err}");
        print_usage_and_exit(1);
    });

    // stdout carries the stdio wire
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let settings = load_settings()?;
    let (name, upstream) = pick_upstream(&settings, cfg.server.as_deref())?;

    let publisher: Arc<dyn RpcEventPublisher> = match &cfg.log_db {
        Some(path) => Arc::new(SqlitePublisher::start(LoggerCfg::new(path))),
        None => Arc::new(TracingPublisher),
    };
    let handler = Proxy::new(ProxyHandler::new(name.clone(), upstream).with_publisher(publisher.clone()));
    let session_opts = SessionOptions {
        name: "downstream".to_string(),
        publisher: Some(publisher),
        ..Default::default()
    };

    match cfg.mode {
        Mode::Stdio => {
            let server = StdioServer::start(
                settings.env.clone(),
                handler,
                session_opts,
                tokio::io::stdin(),
                tokio::io::stdout(),
            )
            .await?;
            tracing::info!(target = "bridge", upstream = %name, "stdio_ready");
            tokio::select! {
                _ = server.wait() => {}
                _ = shutdown_signal() => server.close(),
            }
        }
        Mode::Http => {
            let mut opts = HttpServerOptions {
                session_store: None,
                session: session_opts.clone(),
            };
            if let Some(path) = &settings.session_db {
                let states = SqliteStateStore::open(path)
                    .await
                    .with_context(|| format!("open session db {}", path.display()))?;
                opts.session_store = Some(Arc::new(PersistentSessionStore::new(states, session_opts)));
            }
            let addr: SocketAddr = cfg
                .listen
                .as_deref()
                .unwrap_or(&settings.listen_addr)
                .parse()
                .context("parse listen address")?;
            let server = HttpServer::new(settings.env.clone(), handler, opts);
            let (handle, local) = start_http_server(server, &settings.base_path, addr).await?;
            eprintln!("nanobot-mcp-bridge serving {name} at http://{local}{}", settings.base_path);
            tokio::select! {
                _ = handle => {}
                _ = shutdown_signal() => {}
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(target = "bridge", error = %err, "ctrl_c_unavailable");
        std::future::pending::<()>().await;
    }
}

fn pick_upstream(settings: &Settings, wanted: Option<&str>) -> Result<(String, ServerConfig)> {
    match wanted {
        Some(name) => settings
            .mcp_servers
            .get(name)
            .map(|cfg| (name.to_string(), cfg.clone()))
            .with_context(|| format!("server {name} is not configured")),
        None => settings
            .mcp_servers
            .iter()
            .next()
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .context("no mcp servers configured"),
    }
}

enum Mode {
    Stdio,
    Http,
}

struct Config {
    mode: Mode,
    server: Option<String>,
    listen: Option<String>,
    log_db: Option<PathBuf>,
}

fn parse_args() -> Result<Config, String> {
    let mut args = env::args().skip(1);
    let mode = match args.next().as_deref() {
        Some("stdio") => Mode::Stdio,
        Some("http") => Mode::Http,
        Some("--help" | "-h") => print_usage_and_exit(0),
        Some(other) => return Err(format!("unknown mode `{other}`")),
        None => return Err("a mode is required".into()),
    };
    let mut cfg = Config {
        mode,
        server: None,
        listen: None,
        log_db: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--server" => {
                cfg.server = Some(args.next().ok_or("--server requires a name")?);
            }
            "--listen" => {
                cfg.listen = Some(args.next().ok_or("--listen requires an address")?);
            }
            "--log-db" => {
                let value = args.next().ok_or("--log-db requires a path")?;
                cfg.log_db = Some(PathBuf::from(value));
            }
            "--help" | "-h" => print_usage_and_exit(0),
            other => return Err(format!("unknown argument `{other}`")),
        }
    }
    Ok(cfg)
}

fn print_usage_and_exit(code: i32) -> ! {
    eprintln!(
        "Usage: nanobot-mcp-bridge <stdio|http> [--server <name>] [--listen <addr>] [--log-db <path>]\n\
         Defaults: first configured server, listen address and base path from settings.json"
    );
    process::exit(code);
}
