//! Rendezvous service for peer-to-peer clients.
//!
//! Peers join named rooms over a WebSocket, learn about each other, and
//! exchange offer/answer/ice-candidate messages through the hub until they
//! can talk directly. The hub keeps membership in memory only and never
//! looks inside the negotiation payloads.

pub mod config;
pub mod hub;
