//! # LSNP Rendezvous Server
//!
//! Optional relay for LSNP nodes that cannot rely on LAN broadcast. Nodes
//! REGISTER once and then send everything to the server, which keeps the
//! authoritative presence directory and follow graph and relays each
//! datagram to whoever should see it.
//!
//! ## Responsibilities
//!
//! ### Presence
//! REGISTER is answered with a WELCOME carrying the current peer list, and
//! every other peer hears a PEER_JOINED. Peers that stop sending HEARTBEAT
//! are evicted by a periodic sweep.
//!
//! ### Relay
//! - POST goes to the author's followers only
//! - FOLLOW is recorded and turned into a FOLLOW_NOTIFY for the target
//! - group traffic goes to current members
//! - everything addressed with `TO` is forwarded to that peer
//!
//! ### Validation
//! Every datagram must carry an identity whose ip matches its source, scoped
//! kinds must carry a valid token, and only registered peers are relayed.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(&ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod network;

pub use config::{ServerConfig, ServerError};
pub use network::Server;
