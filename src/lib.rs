//! Realtime collaborative-document server.
//!
//! Clients connect over WebSocket, one connection per document. The server
//! authenticates the account against a signature-based identity provider,
//! resolves per-document permissions, then attaches the connection to the
//! document's [`hub::Hub`] — the single owner of that document's live CRDT
//! replica. Inbound frames are classified and either applied, fanned out,
//! or rejected per the account's permission level; permission changes are
//! pushed into live documents through an internal admin API.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod crdt;
pub mod db;
pub mod error;
pub mod hub;
pub mod permissions;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod web;
