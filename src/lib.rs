//! # corvid
//!
//! An embedded HTTP/1.x serving engine: typed routing, before/after
//! middleware, and a multi-worker server with per-connection idle deadlines.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use corvid::App;
//! use corvid::http::Request;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut app = App::new().port(8080);
//!     app.route("/")?.to(|| "Hello, World!")?;
//!     app.route("/tx/<string>/<uint>")?
//!         .to(|hash: String, n: u64| format!("{hash} output {n}"))?;
//!     app.route("/search")?
//!         .to(|req: &Request| req.query_param("value").unwrap_or_default().to_owned())?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod connection;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;
pub mod timer;

pub use app::App;
pub use config::{ConfigError, ServerConfig};
pub use http::{Headers, IntoResponse, Method, Request, Response, StatusCode};
pub use router::{RouteError, Router, Rule};
pub use server::{Server, ServerError, ShutdownHandle};
