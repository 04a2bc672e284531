//! Contract-bound method stubs.
//!
//! When the host accepts a client it sends the contract description; the
//! client turns it into a [`RemoteInterface`]: one [`RemoteMethod`] per
//! declared method, each checking arity and argument types before a request
//! is issued.

use crate::call::CallFuture;
use crate::client::ClientInner;
use crate::error::ClientError;
use courier_core::{Contract, ContractError, MethodSignature};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// The callable shape of a connected contract.
#[derive(Debug)]
pub struct RemoteInterface {
    contract: Arc<Contract>,
    methods: BTreeMap<String, RemoteMethod>,
}

impl RemoteInterface {
    pub(crate) fn bind(contract: Contract, client: Weak<ClientInner>) -> Self {
        let contract = Arc::new(contract);
        let methods = contract
            .methods
            .keys()
            .map(|name| {
                let method = RemoteMethod {
                    name: name.clone(),
                    contract: contract.clone(),
                    client: client.clone(),
                };
                (name.clone(), method)
            })
            .collect();
        Self { contract, methods }
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn method(&self, name: &str) -> Result<&RemoteMethod, ClientError> {
        self.methods.get(name).ok_or_else(|| {
            ClientError::Contract(ContractError::UndeclaredMethod {
                contract: self.contract.name.clone(),
                method: name.to_string(),
            })
        })
    }

    /// Shorthand for `self.method(name)?.call(args)`.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<CallFuture, ClientError> {
        self.method(name)?.call(args)
    }
}

/// One remote method.
#[derive(Debug)]
pub struct RemoteMethod {
    name: String,
    contract: Arc<Contract>,
    client: Weak<ClientInner>,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &MethodSignature {
        &self.contract.methods[&self.name]
    }

    /// Validate `args` and send the request.
    ///
    /// A mismatch fails here, before anything is sent. Calling a stub kept
    /// from an earlier connection fails with [`ClientError::NotConnected`].
    pub fn call(&self, args: Vec<Value>) -> Result<CallFuture, ClientError> {
        self.contract.validate_call(&self.name, &args)?;
        let client = self.client.upgrade().ok_or(ClientError::Closed)?;
        client.send_bound(&self.name, args)
    }
}
