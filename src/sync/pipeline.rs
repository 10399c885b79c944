//! Value pipeline
//!
//! Maps server ids to what they stand for on the device and converts in both
//! directions:
//!
//! - device bytes to [`ValueUpdate`]s, with alias updates derived from
//!   their target's update
//! - requested values to device bytes, through the alias transform and the
//!   codec
//!
//! The last raw bytes of every entry are cached so that bitfield writes can
//! merge into the surrounding bits.

use crate::alias::{AliasDefinition, OutOfRangePolicy};
use crate::codec;
use crate::error::{Result, WatchError};
use crate::registry::WatchableRegistry;
use crate::types::{
    parse_rpv_path, rpv_path, Endianness, RuntimePublishedValue, ServerId, Value, ValueUpdate,
    Variable, VariableType, WatchableConfiguration, WatchableType,
};
use chrono::Utc;
use std::collections::HashMap;

/// What a server id is bound to
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Variable(Variable),
    Rpv {
        rpv: RuntimePublishedValue,
        endianness: Endianness,
    },
    Alias {
        definition: AliasDefinition,
        /// Server id of the variable or RPV behind the alias
        target: ServerId,
    },
}

impl Binding {
    pub fn watchable_type(&self) -> WatchableType {
        match self {
            Binding::Variable(_) => WatchableType::Variable,
            Binding::Rpv { .. } => WatchableType::RuntimePublishedValue,
            Binding::Alias { .. } => WatchableType::Alias,
        }
    }

    /// Registry path of the entry
    pub fn path(&self) -> String {
        match self {
            Binding::Variable(var) => var.fullname(),
            Binding::Rpv { rpv, .. } => rpv.path(),
            Binding::Alias { definition, .. } => definition.fullpath().to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ValuePipeline {
    bindings: HashMap<ServerId, Binding>,
    /// Variable and RPV paths to server id, for alias resolution
    paths: HashMap<String, ServerId>,
    aliases_of: HashMap<ServerId, Vec<ServerId>>,
    last_raw: HashMap<ServerId, Vec<u8>>,
    decode_errors: u64,
}

impl ValuePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn binding(&self, server_id: &str) -> Option<&Binding> {
        self.bindings.get(server_id)
    }

    /// Updates that could not be decoded so far
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    fn claim(&mut self, server_id: &str, path: String) -> Result<()> {
        if self.bindings.contains_key(server_id) {
            return Err(WatchError::DuplicateEntry(format!(
                "server id {} already bound",
                server_id
            )));
        }
        if self.paths.contains_key(&path) {
            return Err(WatchError::DuplicateEntry(path));
        }
        self.paths.insert(path, server_id.to_string());
        Ok(())
    }

    pub fn add_variable(&mut self, server_id: impl Into<ServerId>, variable: Variable) -> Result<()> {
        let server_id = server_id.into();
        self.claim(&server_id, variable.fullname())?;
        self.bindings.insert(server_id, Binding::Variable(variable));
        Ok(())
    }

    pub fn add_rpv(
        &mut self,
        server_id: impl Into<ServerId>,
        rpv: RuntimePublishedValue,
        endianness: Endianness,
    ) -> Result<()> {
        let server_id = server_id.into();
        self.claim(&server_id, rpv.path())?;
        self.bindings
            .insert(server_id, Binding::Rpv { rpv, endianness });
        Ok(())
    }

    /// Bind an alias after resolving its target
    ///
    /// Fails with [`WatchError::UnresolvedAliasTarget`] when the target is
    /// neither a known variable nor a known RPV. The definition itself is
    /// left to the caller, so an alias file still round-trips.
    pub fn add_alias(
        &mut self,
        server_id: impl Into<ServerId>,
        mut definition: AliasDefinition,
    ) -> Result<()> {
        let server_id = server_id.into();
        if self.bindings.contains_key(&server_id) {
            return Err(WatchError::DuplicateEntry(format!(
                "server id {} already bound",
                server_id
            )));
        }
        let target_type = match definition.target_type() {
            Some(t) => t,
            None => definition.resolve_target_type(|path| {
                self.paths
                    .get(path)
                    .and_then(|id| self.bindings.get(id))
                    .is_some_and(|b| matches!(b, Binding::Variable(_)))
            })?,
        };
        let key = match target_type {
            WatchableType::RuntimePublishedValue => parse_rpv_path(definition.target())
                .map(rpv_path)
                .unwrap_or_else(|| definition.target().to_string()),
            _ => definition.target().to_string(),
        };
        let target = self
            .paths
            .get(&key)
            .filter(|id| {
                self.bindings
                    .get(*id)
                    .is_some_and(|b| b.watchable_type() == target_type)
            })
            .cloned()
            .ok_or_else(|| WatchError::UnresolvedAliasTarget(definition.target().to_string()))?;

        self.aliases_of
            .entry(target.clone())
            .or_default()
            .push(server_id.clone());
        self.bindings
            .insert(server_id, Binding::Alias { definition, target });
        Ok(())
    }

    /// Native type of an entry. Aliases report their target's type.
    pub fn datatype(&self, server_id: &str) -> Option<VariableType> {
        match self.bindings.get(server_id)? {
            Binding::Variable(var) => Some(var.vartype),
            Binding::Rpv { rpv, .. } => Some(rpv.datatype),
            Binding::Alias { target, .. } => self.datatype(target),
        }
    }

    /// Registry content for every binding, grouped by type
    pub fn registry_content(&self) -> HashMap<WatchableType, Vec<(String, WatchableConfiguration)>> {
        let mut content: HashMap<WatchableType, Vec<(String, WatchableConfiguration)>> =
            HashMap::new();
        for (server_id, binding) in &self.bindings {
            let Some(datatype) = self.datatype(server_id) else {
                continue;
            };
            let watchable_type = binding.watchable_type();
            let mut config = WatchableConfiguration::new(watchable_type, datatype, server_id.clone());
            if let Binding::Variable(var) = binding {
                config.enum_def = var.enum_def.clone();
            }
            content
                .entry(watchable_type)
                .or_default()
                .push((binding.path(), config));
        }
        content
    }

    /// Add every binding to the registry in one bulk call
    pub fn populate_registry(&self, registry: &WatchableRegistry) -> Result<()> {
        registry.add_content(self.registry_content())
    }

    /// Server id whose device memory a write to `server_id` lands on
    pub fn device_key(&self, server_id: &str) -> Result<ServerId> {
        match self.bindings.get(server_id) {
            Some(Binding::Alias { target, .. }) => Ok(target.clone()),
            Some(_) => Ok(server_id.to_string()),
            None => Err(WatchError::NodeNotFound(format!("server id {}", server_id))),
        }
    }

    fn decode_one(&self, binding: &Binding, bytes: &[u8]) -> Result<Value> {
        match binding {
            Binding::Variable(var) => var.decode(bytes),
            Binding::Rpv { rpv, endianness } => codec::decode(rpv.datatype, bytes, *endianness),
            Binding::Alias { .. } => Err(WatchError::OperationFailure(
                "aliases have no device memory".into(),
            )),
        }
    }

    /// Turn raw device values into updates, followed by derived alias updates
    pub fn process(&mut self, values: &[(ServerId, Vec<u8>)]) -> Vec<ValueUpdate> {
        let timestamp = Utc::now();
        let mut updates = Vec::with_capacity(values.len());
        for (server_id, bytes) in values {
            let Some(binding) = self.bindings.get(server_id) else {
                tracing::warn!("Value for unknown server id {}", server_id);
                self.decode_errors += 1;
                continue;
            };
            let value = match self.decode_one(binding, bytes) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Cannot decode {}: {}", server_id, e);
                    self.decode_errors += 1;
                    continue;
                }
            };
            updates.push(ValueUpdate {
                server_id: server_id.clone(),
                value,
                timestamp,
            });
            for alias_id in self.aliases_of.get(server_id).into_iter().flatten() {
                if let Some(Binding::Alias { definition, .. }) = self.bindings.get(alias_id) {
                    let alias_value = if definition.gain() == 1.0 && definition.offset() == 0.0 {
                        value
                    } else {
                        Value::Float(definition.compute_device_to_user(value.as_f64()))
                    };
                    updates.push(ValueUpdate {
                        server_id: alias_id.clone(),
                        value: alias_value,
                        timestamp,
                    });
                }
            }
            self.last_raw.insert(server_id.clone(), bytes.clone());
        }
        updates
    }

    /// Bytes to write for a requested value, with the device key they go to
    pub fn encode_write(
        &self,
        server_id: &str,
        value: f64,
        policy: OutOfRangePolicy,
    ) -> Result<(ServerId, Vec<u8>)> {
        let binding = self
            .bindings
            .get(server_id)
            .ok_or_else(|| WatchError::NodeNotFound(format!("server id {}", server_id)))?;
        match binding {
            Binding::Variable(var) => {
                let previous = self.last_raw.get(server_id).map(Vec::as_slice);
                Ok((server_id.to_string(), var.encode(value, previous)?))
            }
            Binding::Rpv { rpv, endianness } => Ok((
                server_id.to_string(),
                codec::encode(rpv.datatype, value, *endianness)?,
            )),
            Binding::Alias { definition, target } => {
                let raw = definition.compute_user_to_device(value, policy)?;
                self.encode_write(target, raw, policy)
            }
        }
    }
}
