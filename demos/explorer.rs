//! A block-explorer style front end served by corvid.
//!
//! The pages are stubs; the point is the route surface.
//!
//! ```text
//! cargo run --example explorer -- --port 8081 --workers 4
//! RUST_LOG=corvid=debug cargo run --example explorer -- --config explorer.toml
//! ```

use std::path::PathBuf;

use clap::Parser;
use corvid::http::{Request, Response, StatusCode};
use corvid::middleware::{Logger, Middleware, RequestContext};
use corvid::security::BasicAuth;
use corvid::{App, Server, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "explorer", about = "Demo block explorer on corvid")]
struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of worker event loops
    #[arg(short, long)]
    workers: Option<usize>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Protect every page with HTTP Basic auth, as `user:password`
    #[arg(long)]
    auth: Option<String>,
}

/// Rejects a crawler that announces itself with a fixed `Accept` value.
struct ScannerBlock;

impl Middleware for ScannerBlock {
    type Context = ();

    fn before_handle(&self, req: &Request, res: &mut Response, _: &mut (), _: &RequestContext) {
        if req.headers().has_token("accept", "q=.2") {
            info!(path = %req.path(), "scanner blocked");
            res.set_code(StatusCode::BadRequest);
            res.end();
        }
    }
}

fn page(title: &str, body: &str) -> Response {
    let mut res = Response::text(format!(
        "<html><head><title>{title}</title></head><body>{body}</body></html>"
    ));
    res.set_header("Content-Type", "text/html; charset=utf-8");
    res
}

fn index(page_no: u64, refresh: bool) -> Response {
    let mut res = page("explorer", &format!("<h1>Blocks</h1><p>page {page_no}</p>"));
    if refresh {
        res.set_header("Refresh", "10");
    }
    res
}

fn build(config: ServerConfig, auth: Option<&str>) -> Result<App, Box<dyn std::error::Error>> {
    let mut app = App::with_config(config).middleware(Logger).middleware(ScannerBlock);
    if let Some((user, pass)) = auth.and_then(|a| a.split_once(':')) {
        app = app.middleware(BasicAuth::new(user, pass).realm("explorer"));
    }

    app.route("/")?.to(|| index(0, false))?;
    app.route("/page/<uint>")?.to(|n: u64| index(n, false))?;
    app.route("/block/<uint>")?
        .to(|height: u64| page("block", &format!("<h2>Block at height {height}</h2>")))?;
    app.route("/block/<string>")?
        .to(|hash: String| page("block", &format!("<h2>Block {hash}</h2>")))?;
    app.route("/tx/<string>")?
        .to(|hash: String| page("tx", &format!("<h2>Transaction {hash}</h2>")))?;
    app.route("/tx/<string>/<uint>")?.to(|hash: String, rings: u64| {
        page("tx", &format!("<h2>Transaction {hash}</h2><p>ring signatures: {rings}</p>"))
    })?;
    app.route("/myoutputs")?.to(|req: &Request| {
        let field = |k: &str| req.query_param(k).unwrap_or_default().to_owned();
        page(
            "outputs",
            &format!(
                "<p>tx {} address {} viewkey {}</p>",
                field("tx_hash"),
                field("xmr_address"),
                if field("viewkey").is_empty() { "missing" } else { "given" }
            ),
        )
    })?;
    app.route("/search")?.to(|req: &Request| {
        let value = req.query_param("value").unwrap_or_default();
        page("search", &format!("<p>searching for {value}</p>"))
    })?;
    app.route("/robots.txt")?.to(|| "User-agent: *\nDisallow: ")?;
    app.route("/autorefresh")?.to(|| index(0, true))?;

    app.catch_all(|req: &Request| (StatusCode::NotFound, format!("no page at {}", req.path())));
    Ok(app)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let app = build(config, cli.auth.as_deref())?;
    let server = Server::bind(app).await?;
    let shutdown = server.shutdown_handle();
    info!(addr = %server.local_addr(), "explorer listening");

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
