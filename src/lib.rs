//! Async client for FreeSWITCH's Event Socket Layer (ESL).
//!
//! This crate provides a control interface into a running FreeSWITCH
//! instance over a single inbound TCP connection: run API commands as you
//! would in the CLI, run them in the background, listen for events, and
//! inject events of your own.
//!
//! If running on the same machine as FreeSWITCH, the client can read the
//! event socket configuration file, so you won't need to provide
//! connection information.
//!
//! # Examples
//!
//! ## Connect and run a command
//!
//! ```rust,no_run
//! use freeswitch_esl_client::{EslClient, EslResult};
//!
//! #[tokio::main]
//! async fn main() -> EslResult<()> {
//!     let client = EslClient::new();
//!
//!     // connect() blocks until disconnection; run it in its own task.
//!     let session = client.clone();
//!     tokio::spawn(async move { session.connect().await });
//!
//!     let status = client.execute("status", &[]).await?;
//!     println!("{status}");
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Listen for events
//!
//! ```rust,no_run
//! use freeswitch_esl_client::EslClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = EslClient::new();
//!     client
//!         .on("HEARTBEAT", |event| {
//!             println!("up since {}", event.get("Up-Time"));
//!         })
//!         .await
//!         .expect("register handler");
//!
//!     // Reconnect whenever the connection terminates abnormally.
//!     while let Err(err) = client.connect().await {
//!         eprintln!("disconnected: {err}; trying again in 5 seconds");
//!         tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod headers;
pub mod protocol;

pub use client::{EslClient, EventHandler};
pub use config::ClientConfig;
pub use error::{EslError, EslResult};
pub use event::{EslEvent, EventName};
pub use headers::Headers;
pub use protocol::{ApiResponse, DisconnectNotice, Packet, PacketDecoder, RawPacket, Reply};
