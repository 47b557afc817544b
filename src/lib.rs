// Symmetric encryption for stored secrets
pub mod crypto;

// Encrypted per-user credential persistence
pub mod store;

// Token expiry evaluation
pub mod validity;

// OAuth refresh-token grant orchestration
pub mod refresh;

// Bearer-key access gate for privileged endpoints
pub mod auth;

// Best-effort webhook notifications
pub mod notify;

// Generic egress relay
pub mod proxy;

// HTTP API
pub mod api;

// Environment configuration
pub mod config;
