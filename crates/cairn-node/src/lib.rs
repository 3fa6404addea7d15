//! # Cairn Node
//!
//! Git smart HTTP server over Cairn storage.
//!
//! A node serves any number of repositories from one shared object store.
//! Standard git clients clone, fetch and push over HTTP; every applied
//! reference change is published on a [`feed::RefUpdateFeed`].
//!
//! ```text
//!   git client ──HTTP──▶ api (axum) ──spawn_blocking──▶ cairn_git::protocol
//!                          │                                  │
//!                     access policy                    cairn_storage
//!                                                 (objects, refs, registry)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin cairn-node -- --api-addr 127.0.0.1:8080
//! git clone http://127.0.0.1:8080/git/alice/demo.git
//! ```
//!
//! ## Modules
//!
//! - [`api`] - Git smart HTTP routes and the repository JSON API
//! - [`access`] - Authorization seam for transfers
//! - [`config`] - Node configuration (YAML file, `CAIRN_*` environment)
//! - [`feed`] - Broadcast of applied reference updates
//! - [`observability`] - Structured logging and request IDs
//! - [`validation`] - Owner and repository name validation
//!
//! ## Example: Creating an AppState
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cairn_storage::RepoStore;
//! use cairn_node::api::{create_router, AppState};
//!
//! let state = AppState::new(Arc::new(RepoStore::default()));
//! let mut updates = state.feed.subscribe();
//! let app = create_router(state);
//! ```

pub mod access;
pub mod api;
pub mod config;
pub mod feed;
pub mod observability;
pub mod validation;
