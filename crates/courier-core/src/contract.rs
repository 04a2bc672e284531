//! Contracts: the named, versioned method sets servers implement.
//!
//! A contract lists every method a server must implement and a client may
//! call, with the primitive type of each positional argument. The same
//! description is sent to clients when they connect, so both sides check
//! calls against one source of truth.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Primitive type tag for a positional argument.
///
/// `Object` covers every structured JSON value (objects, arrays, null).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    Number,
    String,
    Boolean,
    Object,
}

impl ArgType {
    /// The tag a concrete value carries.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Bool(_) => Self::Boolean,
            Value::Null | Value::Array(_) | Value::Object(_) => Self::Object,
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        Self::of(value) == self
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Number => "number",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// Declared shape of one contract method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    /// Argument types, in call order.
    #[serde(default)]
    pub args: Vec<ArgType>,
}

/// A contract description.
///
/// Immutable once loaded; shared behind an `Arc` by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    /// Contract name (also the lookup key in the registry).
    #[serde(default)]
    pub name: String,
    /// Informational version string.
    #[serde(default)]
    pub version: String,
    /// Method name to signature.
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSignature>,
}

impl Contract {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Builder-style method declaration.
    pub fn with_method(
        mut self,
        name: impl Into<String>,
        args: impl IntoIterator<Item = ArgType>,
    ) -> Self {
        self.methods.insert(
            name.into(),
            MethodSignature {
                args: args.into_iter().collect(),
            },
        );
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodSignature> {
        self.methods.get(name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Check a call's arity and argument types against the declaration.
    pub fn validate_call(&self, method: &str, args: &[Value]) -> Result<(), ContractError> {
        let signature = self
            .method(method)
            .ok_or_else(|| ContractError::UndeclaredMethod {
                contract: self.name.clone(),
                method: method.to_string(),
            })?;

        if args.len() != signature.args.len() {
            return Err(ContractError::Arity {
                method: method.to_string(),
                expected: signature.args.len(),
                found: args.len(),
            });
        }

        for (index, (expected, value)) in signature.args.iter().zip(args).enumerate() {
            if !expected.matches(value) {
                return Err(ContractError::ArgType {
                    method: method.to_string(),
                    index,
                    expected: *expected,
                    found: ArgType::of(value),
                });
            }
        }

        Ok(())
    }

    /// Check that `implemented` is exactly this contract's method set.
    ///
    /// Missing methods are reported before undeclared ones.
    pub fn check_implementation<'a>(
        &self,
        implemented: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ContractError> {
        let implemented: BTreeSet<&str> = implemented.into_iter().collect();

        if let Some(missing) = self
            .methods
            .keys()
            .find(|name| !implemented.contains(name.as_str()))
        {
            return Err(ContractError::MissingMethod {
                contract: self.name.clone(),
                method: missing.clone(),
            });
        }

        if let Some(extra) = implemented.iter().find(|name| !self.declares(name)) {
            return Err(ContractError::UndeclaredMethod {
                contract: self.name.clone(),
                method: extra.to_string(),
            });
        }

        Ok(())
    }
}

/// Contract violations and contract loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("contract {contract}: method not implemented: {method}")]
    MissingMethod { contract: String, method: String },
    #[error("contract {contract}: method not defined in the contract: {method}")]
    UndeclaredMethod { contract: String, method: String },
    #[error("{method}() called with {found} arguments, expected {expected}")]
    Arity {
        method: String,
        expected: usize,
        found: usize,
    },
    #[error("{method}() argument {index} is {found}, expected {expected}")]
    ArgType {
        method: String,
        index: usize,
        expected: ArgType,
        found: ArgType,
    },
    #[error("unknown contract: {0}")]
    NotFound(String),
    /// The name cannot be used to look a contract up.
    #[error("invalid contract name: {0:?}")]
    InvalidName(String),
    #[error("failed to read contract {name}: {source}")]
    Load {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse contract {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logic() -> Contract {
        Contract::new("logic", "1.0")
            .with_method("getFrequency", [])
            .with_method("setFrequency", [ArgType::Number])
            .with_method("toggleBookmark", [])
    }

    #[test]
    fn exact_implementation_passes() {
        let contract = logic();
        contract
            .check_implementation(["getFrequency", "setFrequency", "toggleBookmark"])
            .unwrap();
    }

    #[test]
    fn missing_method_fails() {
        let err = logic()
            .check_implementation(["getFrequency", "setFrequency"])
            .unwrap_err();
        assert!(
            matches!(err, ContractError::MissingMethod { ref method, .. } if method == "toggleBookmark")
        );
    }

    #[test]
    fn extra_method_fails() {
        let err = logic()
            .check_implementation(["getFrequency", "setFrequency", "toggleBookmark", "selfDestruct"])
            .unwrap_err();
        assert!(
            matches!(err, ContractError::UndeclaredMethod { ref method, .. } if method == "selfDestruct")
        );
    }

    #[test]
    fn validate_call_checks_arity_and_types() {
        let contract = logic();
        contract.validate_call("setFrequency", &[json!(91.1)]).unwrap();

        assert!(matches!(
            contract.validate_call("setFrequency", &[]),
            Err(ContractError::Arity { expected: 1, found: 0, .. })
        ));
        assert!(matches!(
            contract.validate_call("setFrequency", &[json!("91.1")]),
            Err(ContractError::ArgType {
                index: 0,
                expected: ArgType::Number,
                found: ArgType::String,
                ..
            })
        ));
        assert!(matches!(
            contract.validate_call("seekUp", &[]),
            Err(ContractError::UndeclaredMethod { .. })
        ));
    }

    #[test]
    fn null_and_arrays_are_objects() {
        assert_eq!(ArgType::of(&Value::Null), ArgType::Object);
        assert_eq!(ArgType::of(&json!([1, 2])), ArgType::Object);
        assert_eq!(ArgType::of(&json!(true)), ArgType::Boolean);
    }

    #[test]
    fn parses_contract_file_shape() {
        let contract: Contract = serde_json::from_value(json!({
            "methods": {
                "setFrequency": { "args": ["number"] },
                "seekUp": { "args": [] },
                "toggleBookmark": {}
            }
        }))
        .unwrap();
        assert_eq!(contract.methods.len(), 3);
        assert_eq!(contract.method("setFrequency").unwrap().args, vec![ArgType::Number]);
        assert!(contract.method("toggleBookmark").unwrap().args.is_empty());
    }
}
