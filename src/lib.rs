//! DNS-driven BGP route announcer and Docker-backed DNS server.

pub mod admin;
pub mod bgp;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod containerdns;
pub mod resolver;
pub mod routeros;
pub mod types;
