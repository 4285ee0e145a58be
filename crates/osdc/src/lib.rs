//! Object storage device client.
//!
//! Translates file-extent I/O into object operations, dispatches them to
//! the storage node a cluster map says should hold them, and tracks
//! completion across membership changes, connection resets, and timeouts.

pub mod cluster_map;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod facade;
pub mod layout;
pub mod messenger;
pub mod pg;
pub mod placement;
pub mod registry;
pub mod reply;
pub mod request;
pub mod vino;
pub mod wire;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use facade::{FacadeResult, IoFacade};
pub use messenger::{Messenger, Monitor};
pub use request::Request;
pub use vino::{SnapContext, Vino};
