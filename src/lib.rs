//! Completion-driven HTTP/1.1 server engine.
//!
//! One worker per core, each with its own listener (port sharing via
//! `SO_REUSEPORT`), its own poller, and a fixed pool of connection slots.
//! Every connection carries a tagged job; completions are dispatched against
//! the tag, so all per-connection state is single-threaded and race-free.
//!
//! ```no_run
//! use mazurka::{Context, Outcome, Response, Router, Server};
//!
//! fn home(_ctx: Context) -> Outcome {
//!     Outcome::Respond(Response::ok("home sweet home"))
//! }
//!
//! fn main() -> mazurka::MazurkaResult<()> {
//!     let mut router = Router::new();
//!     router.get("/", home);
//!     Server::bind("0.0.0.0:8080").serve(router)
//! }
//! ```

pub mod arena;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod metrics;
pub mod parser;
pub mod pseudo;
pub mod reactor;
pub mod router;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod tls;
pub mod worker;

// Re-exports for users
pub use config::{Security, ServerConfig, Threading};
pub use error::{MazurkaError, MazurkaResult};
pub use http::{status_name, Body, Context, Method, Outcome, Request, Response, Version, KILL};
pub use router::{Handler, Router};
pub use server::Server;
pub use worker::Link;
