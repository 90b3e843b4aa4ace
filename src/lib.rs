//! Client library for the KeePassXC browser-integration protocol.
//!
//! Talks to a local KeePassXC instance through its `keepassxc-proxy` helper
//! process: length-prefixed JSON frames over the helper's standard streams,
//! encrypted per message after an X25519 key handshake. On top of the
//! channel sits a small state machine (`Disconnected → Connecting → Locked
//! → Unlocked`) that identifies the open database, registers this client
//! with it, and sequences login and password-generation requests.
//!
//! The API is event-driven: actions are fire-and-forget and their outcomes
//! arrive on the stream returned by [`Client::subscribe`].

pub mod client;
pub mod connector;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod registry;
pub mod secret;
pub mod transport;

pub use client::{
    AllowDatabaseHook, Client, ClientConfig, ClientEvent, ClientOptions, ClientState,
};
pub use entry::{Entry, ExtraField};
pub use error::Error;
pub use registry::{
    AssociationRecord, DatabaseHash, DatabaseRegistry, FileRegistry, MemoryRegistry,
};
pub use secret::{Nonce, Protection, SecretBuffer};
