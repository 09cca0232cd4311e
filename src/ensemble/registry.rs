//! Endpoint registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::Ensemble;
use crate::error::CoordError;
use crate::Result;

/// Thread-safe map from endpoint strings (`host:port`) to ensembles.
///
/// Clients resolve their configured endpoints here when connecting.
#[derive(Default)]
pub struct Registry {
    endpoints: RwLock<HashMap<String, Arc<Ensemble>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `ensemble` at `endpoint`, replacing any previous binding.
    pub fn bind(&self, endpoint: impl Into<String>, ensemble: Arc<Ensemble>) -> Result<()> {
        let mut endpoints = self
            .endpoints
            .write()
            .map_err(|_| CoordError::LockPoisoned)?;
        endpoints.insert(endpoint.into(), ensemble);
        Ok(())
    }

    /// Stop serving at `endpoint`.
    pub fn unbind(&self, endpoint: &str) -> Result<Option<Arc<Ensemble>>> {
        let mut endpoints = self
            .endpoints
            .write()
            .map_err(|_| CoordError::LockPoisoned)?;
        Ok(endpoints.remove(endpoint))
    }

    /// Look up the ensemble behind `endpoint`.
    pub fn resolve(&self, endpoint: &str) -> Result<Arc<Ensemble>> {
        let endpoints = self
            .endpoints
            .read()
            .map_err(|_| CoordError::LockPoisoned)?;
        endpoints
            .get(endpoint)
            .cloned()
            .ok_or(CoordError::ConnectionLoss)
    }

    /// Bound endpoints.
    pub fn endpoints(&self) -> Vec<String> {
        let mut list: Vec<String> = self
            .endpoints
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        list.sort();
        list
    }
}
