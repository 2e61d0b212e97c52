//! # faultline-server
//!
//! A local HTTP server that answers with well-formed, malformed and
//! degenerate responses on demand, for exercising an HTTP client's failure
//! handling. Routes are described as data in [`scenario`]; faults that HTTP
//! itself cannot express are injected below the framework by [`listener`].
//!
//! # Example
//!
//! ```no_run
//! use faultline_server::{FaultServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = FaultServer::bind(ServerConfig::bound_to("127.0.0.1:0".parse().unwrap()))
//!         .await
//!         .unwrap();
//!     let handle = server.spawn();
//!     println!("serving {}", handle.base_url());
//!     handle.shutdown().await;
//! }
//! ```

pub mod assets;
pub mod config;
pub mod listener;
pub mod records;
pub mod routes;
pub mod scenario;
pub mod server;

pub use config::ServerConfig;
pub use scenario::{fault_table, FaultScenario};
pub use server::{FaultServer, ServerError, ServerHandle, ServerState};
