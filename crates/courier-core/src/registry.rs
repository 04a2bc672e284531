//! Contract registry.
//!
//! Contracts are loaded on first need from a [`ContractSource`] and cached
//! for the lifetime of the registry.

use crate::contract::{Contract, ContractError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// Where contract descriptions come from.
pub trait ContractSource: Send + Sync {
    fn load(&self, name: &str) -> Result<Contract, ContractError>;
}

/// Loads `<root>/<name>.json` files.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ContractSource for DirectorySource {
    fn load(&self, name: &str) -> Result<Contract, ContractError> {
        // Names arrive off the wire and must stay inside `root`.
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(ContractError::InvalidName(name.to_string()));
        }
        let path = self.root.join(format!("{name}.json"));
        let text = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ContractError::NotFound(name.to_string())
            } else {
                ContractError::Load {
                    name: name.to_string(),
                    source,
                }
            }
        })?;
        serde_json::from_str(&text).map_err(|source| ContractError::Parse {
            name: name.to_string(),
            source,
        })
    }
}

/// A fixed, in-memory set of contracts.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    contracts: HashMap<String, Contract>,
}

impl StaticSource {
    pub fn new(contracts: impl IntoIterator<Item = Contract>) -> Self {
        Self {
            contracts: contracts
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }
}

impl ContractSource for StaticSource {
    fn load(&self, name: &str) -> Result<Contract, ContractError> {
        self.contracts
            .get(name)
            .cloned()
            .ok_or_else(|| ContractError::NotFound(name.to_string()))
    }
}

/// Caching front for a contract source.
pub struct ContractRegistry {
    source: Box<dyn ContractSource>,
    cache: Mutex<HashMap<String, Arc<Contract>>>,
}

impl ContractRegistry {
    pub fn new(source: impl ContractSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registry over an in-memory contract set.
    pub fn with_contracts(contracts: impl IntoIterator<Item = Contract>) -> Self {
        Self::new(StaticSource::new(contracts))
    }

    /// Fetch a contract, loading it on first use.
    ///
    /// The returned contract always carries `name`, even if the source
    /// omitted it.
    pub fn get(&self, name: &str) -> Result<Arc<Contract>, ContractError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(contract) = cache.get(name) {
            return Ok(contract.clone());
        }

        let mut contract = self.source.load(name)?;
        if contract.name.is_empty() {
            contract.name = name.to_string();
        }
        tracing::debug!(contract = %name, methods = contract.methods.len(), "loaded contract");

        let contract = Arc::new(contract);
        cache.insert(name.to_string(), contract.clone());
        Ok(contract)
    }

    /// Number of contracts loaded so far.
    pub fn loaded(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractRegistry")
            .field("loaded", &self.loaded())
            .finish()
    }
}
