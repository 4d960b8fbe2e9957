//! Core plumbing for the turnip Git services: the pkt-line and request
//! codecs spoken between the frontends, the virtualisation proxy and the
//! backend; the on-disk repository store; and the client for the
//! authorisation service that translates externally visible repository
//! paths into storage paths.
pub mod auth;
pub mod error;
pub mod logger;
pub mod pktline;
pub mod request;
pub mod store;
#[cfg(any(test, feature = "test"))]
pub mod test;
pub mod virtinfo;

pub use auth::AuthParams;
pub use error::{ErrorKind, VirtError};
pub use request::{Command, Request};
