//! Security middleware: HTTP Basic authentication and CORS.

pub mod middleware;

pub use middleware::{AuthContext, BasicAuth, Cors, CorsContext};
