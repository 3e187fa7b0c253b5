//! # LSNP Node Library
//!
//! Everything a peer needs to take part in an LSNP network: presence,
//! posts and direct messages, the follow graph, file transfer, tic-tac-toe
//! and groups. A node runs either in peer mode (broadcast discovery on the
//! LAN, unicast to known peers) or in relay mode (all traffic goes through a
//! rendezvous server).
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Owns the UDP socket and the shared registries. Exposes the outbound API
//! (`post`, `send_dm`, `send_file`, `invite_game`, ...) and runs the periodic
//! presence, heartbeat and cleanup tasks.
//!
//! ### Dispatch Module (`dispatch`)
//! Validates every inbound datagram (identity binding, addressing, token
//! scope) and routes it to the matching handler. Reliable kinds are
//! acknowledged here.
//!
//! ### Reliable Module (`reliable`)
//! Retransmission with ACK correlation by message id.
//!
//! ### Files Module (`files`)
//! Offer/accept state machine, chunk reassembly and transfer timeouts.
//!
//! ### Game Module (`game`)
//! Tic-tac-toe sessions with turn, symbol and outcome validation.
//!
//! ### Input Module (`input`)
//! Parses terminal command lines into [`input::Command`] values.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (node, mut events) = Node::bind(NodeConfig::default(), "alice").await?;
//!
//!     let runner = node.clone();
//!     tokio::spawn(async move { runner.run().await });
//!
//!     node.post("Hello LSNP").await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
mod dispatch;
pub mod events;
pub mod files;
pub mod game;
pub mod input;
pub mod network;
pub mod reliable;

pub use config::{ConfigError, NodeConfig};
pub use events::NodeEvent;
pub use files::{CompletedFile, FileOffer, TransferProgress, TransferStatus};
pub use game::{GameOutcome, GameSession, GameStatus, Symbol};
pub use network::{Mode, Node, NodeError};
pub use reliable::{DeliveryError, RetryPolicy};
