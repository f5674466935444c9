//! # dgsm-proc
//!
//! Supervises interactive server processes through their console.
//!
//! A [`Supervisor`] launches one application, reads its merged output line by
//! line, and fans every line out through an [`OutputBroker`]. Detectors read
//! that stream to decide when the server is online, which version it runs and
//! who is connected; waiters built on the same broker let commands send input
//! and collect the response.
//!
//! ```rust,no_run
//! use dgsm_proc::{profiles, AppDef, Notice, Reply, Supervisor, SupervisorOptions};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let profile = profiles::lookup("minecraft").unwrap();
//! let sup = Supervisor::new(
//! 	AppDef {
//! 		name: "mc".into(),
//! 		argv: vec!["./start.sh".into()],
//! 		..AppDef::default()
//! 	},
//! 	profile,
//! 	profile.detectors().unwrap(),
//! 	SupervisorOptions::default(),
//! );
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Notice>();
//! let reply: Reply = Arc::new(tx);
//! sup.start(reply).await;
//! while let Ok(notice) = rx.try_recv() {
//! 	println!("{:?}", notice);
//! }
//! # }
//! ```

pub mod commands;
pub mod detect;
pub mod output;
pub mod profiles;
pub mod spawn;
pub mod supervisor;
#[cfg(unix)]
pub mod tee;
pub mod tree;
pub mod types;
pub mod waiter;

pub use commands::{CommandError, CommandSpec};
pub use detect::{AppState, DetectorSet};
pub use output::{OutputBroker, Subscription};
pub use profiles::Profile;
pub use spawn::{SpawnError, TeeConfig};
pub use supervisor::{Supervisor, SupervisorOptions, Timeouts};
pub use types::*;
pub use waiter::{PatternMatch, Waiter, WaiterError};
