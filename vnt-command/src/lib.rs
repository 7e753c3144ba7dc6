//! Typed builders for the command lines the harness runs on remote hosts.
//!
//! Every tool gets a value object with explicit optional fields ([`Mz`], [`Tcpdump`], [`Ping`])
//! or a set of constructor functions ([`ip`], [`sysctl`], [`nc`]). They all produce a
//! [`Command`], which keeps the argument vector intact until the very end, and only renders a
//! quoted shell line for logging or for transports that need one.

mod command;
pub use command::{quote, Command, Error, Result};

pub mod ip;
pub mod nc;
pub mod sysctl;

mod capture;
pub use capture::Tcpdump;

mod mz;
pub use mz::{ArpOp, Mz, PacketKind, ProtocolParams};

mod ping;
pub use ping::Ping;
