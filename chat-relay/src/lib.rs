//! Line-oriented TCP chat relay.
//!
//! The relay keeps a roster of connected usernames, fans group lines out to
//! everyone but their sender, and routes `__DM__:` private messages between
//! named peers. Modules, leaf first:
//!
//! - [`protocol`] defines the wire markers and the line framing helpers.
//! - [`session`] is one connected client as the relay sees it: a username and
//!   an outbound queue drained onto the socket by a writer pump.
//! - [`registry`] holds live sessions keyed by username, in join order.
//! - [`router`] classifies inbound lines as group, private or malformed.
//! - [`broadcast`] delivers group lines, roster pushes and private messages,
//!   and runs the departure sequence for peers that stop accepting lines.
//! - [`supervisor`] drives each connection through handshake, active loop
//!   and teardown.
//! - [`server`] accepts TCP connections and spawns a supervisor per client.
//! - [`cli`] and [`client`] provide the command line and a terminal client.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod supervisor;
