// src/lib.rs
pub mod cgi;
pub mod config;
pub mod conn;
pub mod error;
pub mod handlers;
pub mod http;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod multipart;
pub mod parser;
pub mod reactor;
pub mod response;
pub mod server;
pub mod session;
pub mod slab;
pub mod syscalls;

// Re-exports for users
pub use cgi::{CgiProcess, CgiState, ChildRegistry};
pub use config::Config;
pub use error::{ResponseError, WebservError, WebservResult};
pub use http::{Method, Request};
pub use logging::{init_logging, init_logging_json};
pub use reactor::ShutdownHandle;
pub use response::Response;
pub use server::Server;
