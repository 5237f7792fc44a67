//! Master-side attribute service backing mirror fetches.
//!
//! Mirrors resolve cache misses by sending an [`AttrRequest`] upstream; the
//! master answers out of its own authoritative cache. The transport carrying
//! these messages is not this crate's concern.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attr::FileAttr;
use crate::cache::AttributeCache;
use crate::path;

/// Attribute query from a mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrRequest {
    /// Rootless path being resolved.
    pub name: String,
    /// Identity of the querying mirror, for diagnostics.
    pub origin: String,
}

/// Reply carrying one or more attribute records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrResponse {
    pub attrs: Vec<FileAttr>,
}

impl AttrResponse {
    /// The record answering `name`. Mirrors select it from the vector; the
    /// server is free to piggyback related records.
    pub fn select(&self, name: &str) -> Option<&FileAttr> {
        self.attrs.iter().find(|attr| attr.path == name)
    }
}

/// Serves attribute queries out of the master's cache.
pub struct AttrServer {
    attrs: Arc<AttributeCache>,
}

impl AttrServer {
    pub fn new(attrs: Arc<AttributeCache>) -> Self {
        Self { attrs }
    }

    /// Answers one query. Directories come back with their listing so the
    /// mirror can satisfy sibling lookups locally. A rooted path is a
    /// protocol violation and aborts.
    pub async fn get_attr(&self, request: &AttrRequest) -> AttrResponse {
        path::assert_rootless(&request.name);
        debug!(origin = %request.origin, name = %request.name, "attribute query");
        let attr = self.attrs.get_dir(&request.name).await;
        AttrResponse { attrs: vec![attr] }
    }
}
