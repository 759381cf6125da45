//! LoRaWAN Join Server core.
//!
//! Handles OTAA join-requests, derives and stores session keys, and serves
//! key lookups to Network and Application Servers.

pub mod auth;
pub mod cleanup;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod interop;
pub mod joinserver;
pub mod keyvault;
pub mod lorawan;
pub mod provisioning;
pub mod registry;
