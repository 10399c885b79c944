//! Alias definitions and their gain/offset/clamp transform
//!
//! An alias is a named view over a Variable or an RPV:
//!
//! ```text
//! alias = raw * gain + offset
//! raw   = (alias - offset) / gain
//! ```
//!
//! `min`/`max` bound the alias-side value of a write. The bound is applied
//! before inversion, so with `gain=2, offset=1, max=100` a request for `999.99`
//! becomes `100` and then a raw value of `49.5`.
//!
//! Definitions come from the firmware description alias file (a JSON object
//! keyed by alias path), see [`load_alias_map`].

use crate::error::{Result, WatchError};
use crate::types::{is_rpv_path, WatchableType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// What to do with a write outside an alias `[min, max]` range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutOfRangePolicy {
    /// Saturate to the nearest bound
    #[default]
    Clamp,
    /// Fail the write with [`WatchError::OutOfRange`]
    Reject,
}

/// A validated alias definition
#[derive(Debug, Clone, PartialEq)]
pub struct AliasDefinition {
    fullpath: String,
    target: String,
    target_type: Option<WatchableType>,
    gain: f64,
    offset: f64,
    min: f64,
    max: f64,
}

impl AliasDefinition {
    /// Create and validate an alias. Missing numeric parameters take their defaults
    /// (`gain=1`, `offset=0`, `min=-inf`, `max=+inf`).
    pub fn new(
        fullpath: impl Into<String>,
        target: impl Into<String>,
        target_type: Option<WatchableType>,
        gain: Option<f64>,
        offset: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Result<Self> {
        let alias = Self {
            fullpath: fullpath.into(),
            target: target.into(),
            target_type,
            gain: gain.unwrap_or(1.0),
            offset: offset.unwrap_or(0.0),
            min: min.unwrap_or(f64::NEG_INFINITY),
            max: max.unwrap_or(f64::INFINITY),
        };
        alias.validate()?;
        Ok(alias)
    }

    /// Alias with default gain, offset and range
    pub fn simple(fullpath: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        Self::new(fullpath, target, None, None, None, None, None)
    }

    fn invalid(&self, message: impl Into<String>) -> WatchError {
        WatchError::InvalidAlias {
            fullpath: self.fullpath.clone(),
            message: message.into(),
        }
    }

    /// Check every invariant of the definition
    pub fn validate(&self) -> Result<()> {
        if self.fullpath.trim().is_empty() {
            return Err(self.invalid("fullpath is empty"));
        }
        if self.target.trim().is_empty() {
            return Err(self.invalid("target is empty"));
        }
        if self.target_type == Some(WatchableType::Alias) {
            return Err(self.invalid("an alias cannot point to another alias"));
        }
        if !self.gain.is_finite() {
            return Err(self.invalid(format!("gain {} is not finite", self.gain)));
        }
        if self.gain == 0.0 {
            return Err(self.invalid("gain cannot be zero"));
        }
        if !self.offset.is_finite() {
            return Err(self.invalid(format!("offset {} is not finite", self.offset)));
        }
        if self.min.is_nan() || self.max.is_nan() {
            return Err(self.invalid("min and max cannot be NaN"));
        }
        if self.min > self.max {
            return Err(self.invalid(format!("min {} is greater than max {}", self.min, self.max)));
        }
        Ok(())
    }

    pub fn fullpath(&self) -> &str {
        &self.fullpath
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_type(&self) -> Option<WatchableType> {
        self.target_type
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn is_resolved(&self) -> bool {
        self.target_type.is_some()
    }

    /// Set the target type once it is known. The type is locked afterwards.
    pub fn set_target_type(&mut self, target_type: WatchableType) -> Result<()> {
        if target_type == WatchableType::Alias {
            return Err(self.invalid("an alias cannot point to another alias"));
        }
        match self.target_type {
            Some(current) if current != target_type => Err(self.invalid(format!(
                "target type is already {} and cannot become {}",
                current, target_type
            ))),
            _ => {
                self.target_type = Some(target_type);
                Ok(())
            }
        }
    }

    /// Classify the target as a variable (found by `is_variable`) or an RPV
    pub fn resolve_target_type<F>(&mut self, is_variable: F) -> Result<WatchableType>
    where
        F: Fn(&str) -> bool,
    {
        if let Some(t) = self.target_type {
            return Ok(t);
        }
        let resolved = if is_variable(&self.target) {
            WatchableType::Variable
        } else if is_rpv_path(&self.target) {
            WatchableType::RuntimePublishedValue
        } else {
            return Err(WatchError::UnresolvedAliasTarget(self.target.clone()));
        };
        self.set_target_type(resolved)?;
        tracing::debug!("Alias {} resolved to {} {}", self.fullpath, resolved, self.target);
        Ok(resolved)
    }

    /// Raw target value to alias value
    pub fn compute_device_to_user(&self, raw: f64) -> f64 {
        raw * self.gain + self.offset
    }

    /// Alias value requested by a write to the raw target value
    ///
    /// The range is applied on the alias side before inversion. Non-finite
    /// requests are always rejected.
    pub fn compute_user_to_device(&self, value: f64, policy: OutOfRangePolicy) -> Result<f64> {
        if value.is_nan() {
            return Err(WatchError::OutOfRange {
                value,
                min: self.min,
                max: self.max,
            });
        }
        let bounded = if value < self.min || value > self.max {
            match policy {
                OutOfRangePolicy::Clamp => value.clamp(self.min, self.max),
                OutOfRangePolicy::Reject => {
                    return Err(WatchError::OutOfRange {
                        value,
                        min: self.min,
                        max: self.max,
                    })
                }
            }
        } else {
            value
        };
        if !bounded.is_finite() {
            return Err(WatchError::OutOfRange {
                value,
                min: self.min,
                max: self.max,
            });
        }
        let raw = (bounded - self.offset) / self.gain;
        if !raw.is_finite() {
            return Err(WatchError::OutOfRange {
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(raw)
    }

    /// Dictionary form used by the alias file
    ///
    /// Infinite bounds and an unresolved target type are left out.
    pub fn to_dict(&self) -> Map<String, JsonValue> {
        let mut dict = Map::new();
        dict.insert("fullpath".into(), self.fullpath.clone().into());
        dict.insert("target".into(), self.target.clone().into());
        if let Some(t) = self.target_type {
            dict.insert("target_type".into(), t.tag().into());
        }
        dict.insert("gain".into(), self.gain.into());
        dict.insert("offset".into(), self.offset.into());
        if self.min.is_finite() {
            dict.insert("min".into(), self.min.into());
        }
        if self.max.is_finite() {
            dict.insert("max".into(), self.max.into());
        }
        dict
    }

    /// Build from the dictionary form. Optional keys fall back to defaults.
    pub fn from_dict(dict: &Map<String, JsonValue>) -> Result<Self> {
        let fullpath = string_field(dict, "fullpath")
            .map_err(|message| WatchError::InvalidAlias {
                fullpath: String::new(),
                message,
            })?
            .unwrap_or_default();
        let bad = |message: String| WatchError::InvalidAlias {
            fullpath: fullpath.clone(),
            message,
        };

        let target = string_field(dict, "target")
            .map_err(bad)?
            .ok_or_else(|| bad("missing target".into()))?;
        let target_type = match string_field(dict, "target_type").map_err(bad)? {
            None => None,
            Some(tag) => Some(
                WatchableType::from_tag(&tag)
                    .ok_or_else(|| bad(format!("unknown target type \"{}\"", tag)))?,
            ),
        };
        let gain = number_field(dict, "gain").map_err(bad)?;
        let offset = number_field(dict, "offset").map_err(bad)?;
        let min = number_field(dict, "min").map_err(bad)?;
        let max = number_field(dict, "max").map_err(bad)?;

        Self::new(fullpath.clone(), target, target_type, gain, offset, min, max)
    }
}

fn string_field(dict: &Map<String, JsonValue>, key: &str) -> std::result::Result<Option<String>, String> {
    match dict.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(format!("{} must be a string, got {}", key, other)),
    }
}

fn number_field(dict: &Map<String, JsonValue>, key: &str) -> std::result::Result<Option<f64>, String> {
    match dict.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("{} is not representable as a float", key)),
        Some(other) => Err(format!("{} must be a number, got {}", key, other)),
    }
}

/// Parse an alias file: a JSON object mapping alias path to its definition
///
/// A definition without a `fullpath` key takes the key it is stored under.
pub fn load_alias_map(json: &str) -> Result<BTreeMap<String, AliasDefinition>> {
    let root: JsonValue = serde_json::from_str(json)?;
    let JsonValue::Object(entries) = root else {
        return Err(WatchError::Config(
            "alias file must contain a JSON object".to_string(),
        ));
    };

    let mut aliases = BTreeMap::new();
    for (key, entry) in entries {
        let JsonValue::Object(mut dict) = entry else {
            return Err(WatchError::InvalidAlias {
                fullpath: key,
                message: "definition must be an object".to_string(),
            });
        };
        dict.entry("fullpath")
            .or_insert_with(|| JsonValue::String(key.clone()));
        let alias = AliasDefinition::from_dict(&dict)?;
        aliases.insert(alias.fullpath().to_string(), alias);
    }
    tracing::debug!("Loaded {} alias definitions", aliases.len());
    Ok(aliases)
}

/// Serialize aliases back to the alias file format
pub fn dump_alias_map(aliases: &BTreeMap<String, AliasDefinition>) -> Result<String> {
    let root: Map<String, JsonValue> = aliases
        .iter()
        .map(|(k, v)| (k.clone(), JsonValue::Object(v.to_dict())))
        .collect();
    Ok(serde_json::to_string_pretty(&JsonValue::Object(root))?)
}
