// Credential vault, access gate and job runner for an M365 API gateway

// HTTP routers and error mapping
pub mod api;

// Structured audit events
pub mod audit;

// Bearer header parsing
pub mod auth;

pub mod config;

// Encrypted upstream credential storage
pub mod credentials;

// Secret encryption at rest
pub mod crypto;

// Schema and migrations
pub mod db;

// API keys, permissions, tiers
pub mod gate;

// Background bulk operations
pub mod jobs;

pub mod server;

// Outbound Graph API client
pub mod upstream;

// Upstream token lifecycle
pub mod vault;
