//! Privileged disk-writer helper for Raspberry Pi Imager on Windows.
//!
//! Two halves share this crate: the elevated helper process
//! ([`helper::HelperService`], built into the `rpi-imager-helper` binary)
//! and the client side the GUI links against ([`client::HelperClient`]).
//! They speak the framed protocol in [`protocol`] over the local socket in
//! [`transport`]; the helper performs the actual raw-disk work through
//! [`writer`], [`verify`], [`customize`] and [`format`].

pub mod client;
pub mod customize;
pub mod disk;
pub mod elevation;
pub mod error;
pub mod fat;
pub mod format;
pub mod helper;
pub mod logging;
pub mod partition;
pub mod protocol;
pub mod transport;
pub mod verify;
pub mod writer;
