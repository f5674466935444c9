//! # dgsm-link
//!
//! A reconnecting, two-peer duplex link over TCP.
//!
//! One side listens for a single inbound connection, the other dials out. Once
//! connected both sides are identical: every message is a JSON document followed
//! by a two-byte separator, each received message is handed to its own task, and
//! when the connection drops both sides go back to polling until they find each
//! other again.
//!
//! ```rust,no_run
//! use dgsm_link::{Link, LinkConfig, LinkHandler, Payload, Role};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl LinkHandler<Payload> for Echo {
//! 	async fn on_message(&self, link: Link<Payload>, msg: Payload) {
//! 		let _ = link.write(&msg).await;
//! 	}
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let link = Link::new(LinkConfig::new(Role::Listen, "127.0.0.1:8888"), Echo);
//! link.spawn().await;
//! # }
//! ```

pub mod error;
pub mod frame;
pub mod link;
pub mod payload;

pub use error::LinkError;
pub use link::{Link, LinkConfig, LinkHandler, LinkState, Role, POLL_INTERVAL, WRITE_TIMEOUT};
pub use payload::{AppInfo, Payload, UserCmd};
