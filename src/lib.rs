//! fsmirror - a replicated filesystem attribute cache for distributed builds.
//!
//! One master process holds the authoritative in-memory view of a virtual
//! filesystem tree; worker mirrors hold replicas, pulling attributes on
//! demand through [`cache::Getter`] and receiving asynchronous update
//! batches through the subscriber fanout. Builds running on workers observe
//! a coherent tree through the [`replica::MirrorFs`] surface, and the master
//! executes logical `mkdir`/`rm` against the shared tree via [`fileops`]
//! without touching any real disk.

pub mod attr;
pub mod cache;
pub mod config;
pub mod fileops;
pub mod path;
pub mod replica;
pub mod server;
