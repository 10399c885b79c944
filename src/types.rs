//! Core data types for watchlink-rs
//!
//! This module contains the fundamental data structures shared by the codec,
//! the alias layer and the registry.
//!
//! # Main Types
//!
//! - [`WatchableType`] - The three kinds of watchables (var, alias, rpv)
//! - [`VariableType`] - Native device types as named in firmware descriptions
//! - [`VariableLocation`] - A device memory address
//! - [`Variable`] - A memory-backed watchable, possibly a bitfield
//! - [`RuntimePublishedValue`] - A device-published value identified by a numeric ID
//! - [`WatchableConfiguration`] - How the registry interprets a leaf
//! - [`Value`] / [`ValueUpdate`] - Decoded values and the updates broadcast to watchers

use crate::codec;
use crate::error::{Result, WatchError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier assigned by the server to a watchable, used to correlate broadcasts
pub type ServerId = String;

/// Process-wide counter for unique IDs
///
/// Wraps around on overflow. IDs are unique only for the lifetime of the process.
static NEXT_UNIQUE_ID: AtomicU64 = AtomicU64::new(1);

/// Get a process-unique numeric ID
pub fn next_unique_id() -> u64 {
    NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed)
}

/// The kind of a watchable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchableType {
    /// Raw device variable at a memory address
    Variable,
    /// Unit-converted view over a Variable or RPV
    Alias,
    /// Runtime Published Value
    RuntimePublishedValue,
}

impl WatchableType {
    /// All watchable types, in registry order
    pub const ALL: [WatchableType; 3] = [
        WatchableType::Variable,
        WatchableType::Alias,
        WatchableType::RuntimePublishedValue,
    ];

    /// Short tag used in fully qualified names
    pub fn tag(&self) -> &'static str {
        match self {
            WatchableType::Variable => "var",
            WatchableType::Alias => "alias",
            WatchableType::RuntimePublishedValue => "rpv",
        }
    }

    /// Parse the short FQN tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "var" => Some(WatchableType::Variable),
            "alias" => Some(WatchableType::Alias),
            "rpv" => Some(WatchableType::RuntimePublishedValue),
            _ => None,
        }
    }

    /// Index into per-type arrays
    pub(crate) fn index(&self) -> usize {
        match self {
            WatchableType::Variable => 0,
            WatchableType::Alias => 1,
            WatchableType::RuntimePublishedValue => 2,
        }
    }
}

impl std::fmt::Display for WatchableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Byte order of a value in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Native type of a device value
///
/// Names follow the firmware description format (`sint32`, `float64`, ...).
/// Only the 8 to 64 bit integers, `float32`, `float64` and `boolean` have a
/// codec today. The other variants are reserved and fail with
/// [`WatchError::NotImplemented`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    Sint8,
    Sint16,
    Sint32,
    Sint64,
    Sint128,
    Sint256,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uint128,
    Uint256,
    Float8,
    Float16,
    Float32,
    Float64,
    Float128,
    Float256,
    Cfloat8,
    Cfloat16,
    Cfloat32,
    Cfloat64,
    Cfloat128,
    Cfloat256,
    Boolean,
    Struct,
}

impl VariableType {
    /// Every variant, used for name lookup
    pub const ALL: [VariableType; 26] = [
        VariableType::Sint8,
        VariableType::Sint16,
        VariableType::Sint32,
        VariableType::Sint64,
        VariableType::Sint128,
        VariableType::Sint256,
        VariableType::Uint8,
        VariableType::Uint16,
        VariableType::Uint32,
        VariableType::Uint64,
        VariableType::Uint128,
        VariableType::Uint256,
        VariableType::Float8,
        VariableType::Float16,
        VariableType::Float32,
        VariableType::Float64,
        VariableType::Float128,
        VariableType::Float256,
        VariableType::Cfloat8,
        VariableType::Cfloat16,
        VariableType::Cfloat32,
        VariableType::Cfloat64,
        VariableType::Cfloat128,
        VariableType::Cfloat256,
        VariableType::Boolean,
        VariableType::Struct,
    ];

    /// Firmware description name of this type
    pub fn name(&self) -> &'static str {
        match self {
            VariableType::Sint8 => "sint8",
            VariableType::Sint16 => "sint16",
            VariableType::Sint32 => "sint32",
            VariableType::Sint64 => "sint64",
            VariableType::Sint128 => "sint128",
            VariableType::Sint256 => "sint256",
            VariableType::Uint8 => "uint8",
            VariableType::Uint16 => "uint16",
            VariableType::Uint32 => "uint32",
            VariableType::Uint64 => "uint64",
            VariableType::Uint128 => "uint128",
            VariableType::Uint256 => "uint256",
            VariableType::Float8 => "float8",
            VariableType::Float16 => "float16",
            VariableType::Float32 => "float32",
            VariableType::Float64 => "float64",
            VariableType::Float128 => "float128",
            VariableType::Float256 => "float256",
            VariableType::Cfloat8 => "cfloat8",
            VariableType::Cfloat16 => "cfloat16",
            VariableType::Cfloat32 => "cfloat32",
            VariableType::Cfloat64 => "cfloat64",
            VariableType::Cfloat128 => "cfloat128",
            VariableType::Cfloat256 => "cfloat256",
            VariableType::Boolean => "boolean",
            VariableType::Struct => "struct",
        }
    }

    /// Look up a type by its firmware description name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// Size of the type in bits. `None` for `struct`.
    pub fn size_bits(&self) -> Option<u32> {
        codec::get_size_bits(*self)
    }

    /// Size of the type in bytes. `None` for `struct`.
    pub fn size_bytes(&self) -> Option<usize> {
        self.size_bits().map(|b| (b as usize).div_ceil(8))
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            VariableType::Sint8
                | VariableType::Sint16
                | VariableType::Sint32
                | VariableType::Sint64
                | VariableType::Sint128
                | VariableType::Sint256
        )
    }

    pub fn is_integer(&self) -> bool {
        self.is_signed()
            || matches!(
                self,
                VariableType::Uint8
                    | VariableType::Uint16
                    | VariableType::Uint32
                    | VariableType::Uint64
                    | VariableType::Uint128
                    | VariableType::Uint256
            )
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            VariableType::Float8
                | VariableType::Float16
                | VariableType::Float32
                | VariableType::Float64
                | VariableType::Float128
                | VariableType::Float256
                | VariableType::Cfloat8
                | VariableType::Cfloat16
                | VariableType::Cfloat32
                | VariableType::Cfloat64
                | VariableType::Cfloat128
                | VariableType::Cfloat256
        )
    }
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A decoded device value
///
/// Integers keep their exact width so 64-bit values survive untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl Value {
    /// Lossy conversion for display and alias math
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Signed(v) => v as f64,
            Value::Unsigned(v) => v as f64,
            Value::Float(v) => v,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
        }
    }
}

/// A device memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableLocation {
    address: u64,
}

impl VariableLocation {
    pub fn new(address: u64) -> Self {
        Self { address }
    }

    /// Build an address from its raw bytes (1 to 8 bytes) in the given byte order
    pub fn from_bytes(bytes: &[u8], endianness: Endianness) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > 8 {
            return Err(WatchError::BadPath(format!(
                "address must be 1 to 8 bytes long, got {}",
                bytes.len()
            )));
        }
        let mut buf = [0u8; 8];
        let address = match endianness {
            Endianness::Little => {
                buf[..bytes.len()].copy_from_slice(bytes);
                u64::from_le_bytes(buf)
            }
            Endianness::Big => {
                buf[8 - bytes.len()..].copy_from_slice(bytes);
                u64::from_be_bytes(buf)
            }
        };
        Ok(Self { address })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Apply a signed offset, e.g. when descending into a struct member
    pub fn add_offset(&self, offset: i64) -> Result<Self> {
        self.address
            .checked_add_signed(offset)
            .map(Self::new)
            .ok_or_else(|| {
                WatchError::BadPath(format!(
                    "offset {} moves address 0x{:X} out of range",
                    offset, self.address
                ))
            })
    }

    /// Check that the address fits a device with the given address width
    pub fn fits_width(&self, address_bits: u32) -> bool {
        address_bits >= 64 || self.address <= codec::bitmask(address_bits)
    }
}

/// Bit range of a bitfield inside a wider integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bitfield {
    pub offset: u32,
    pub size: u32,
}

/// Named enumeration attached to a variable
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub values: BTreeMap<String, i64>,
}

impl EnumDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: i64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// First enumerator with the given value
    pub fn get_name(&self, value: i64) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, v)| **v == value)
            .map(|(k, _)| k.as_str())
    }

    pub fn get_value(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }
}

/// A variable living in device memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Leaf name
    pub name: String,
    /// Native type
    pub vartype: VariableType,
    /// Path segments leading to this variable (excluding the name)
    pub path_segments: Vec<String>,
    /// Memory location
    pub location: VariableLocation,
    /// Byte order in memory
    pub endianness: Endianness,
    /// Bit range when the variable is a bitfield
    #[serde(default)]
    pub bitfield: Option<Bitfield>,
    /// Optional enumeration
    #[serde(default, rename = "enum")]
    pub enum_def: Option<EnumDef>,
}

impl Variable {
    /// Create a whole-value variable
    pub fn new(
        name: impl Into<String>,
        vartype: VariableType,
        path_segments: Vec<String>,
        location: VariableLocation,
        endianness: Endianness,
    ) -> Self {
        Self {
            name: name.into(),
            vartype,
            path_segments,
            location,
            endianness,
            bitfield: None,
            enum_def: None,
        }
    }

    /// Turn this variable into a bitfield
    ///
    /// If one of `offset`/`size` is given, both are materialized: a missing
    /// offset is 0 and a missing size spans to the top of the type.
    pub fn with_bitfield(mut self, offset: Option<u32>, size: Option<u32>) -> Result<Self> {
        if offset.is_none() && size.is_none() {
            self.bitfield = None;
            return Ok(self);
        }
        let type_bits = self
            .vartype
            .size_bits()
            .ok_or_else(|| WatchError::NotImplemented {
                type_name: self.vartype.to_string(),
            })?;
        if !(self.vartype.is_integer() || self.vartype == VariableType::Boolean) || type_bits > 64
        {
            return Err(WatchError::BadPath(format!(
                "{}: bitfields are only supported on integers up to 64 bits, not {}",
                self.name, self.vartype
            )));
        }

        let offset = offset.unwrap_or(0);
        let size = size.unwrap_or(type_bits.saturating_sub(offset));
        if size == 0 || offset + size > type_bits {
            return Err(WatchError::BadPath(format!(
                "{}: bitfield offset={} size={} does not fit in {}",
                self.name, offset, size, self.vartype
            )));
        }
        self.bitfield = Some(Bitfield { offset, size });
        Ok(self)
    }

    pub fn with_enum(mut self, enum_def: EnumDef) -> Self {
        self.enum_def = Some(enum_def);
        self
    }

    /// Full slash path of the variable
    pub fn fullname(&self) -> String {
        let mut path = String::new();
        for segment in self.path_segments.iter().chain(std::iter::once(&self.name)) {
            path.push('/');
            path.push_str(segment);
        }
        path
    }

    /// Number of bytes to read from memory
    pub fn size_bytes(&self) -> Option<usize> {
        self.vartype.size_bytes()
    }

    pub fn is_bitfield(&self) -> bool {
        self.bitfield.is_some()
    }

    /// Decode raw memory into a value, applying the bitfield if any
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let value = codec::decode(self.vartype, bytes, self.endianness)?;
        match self.bitfield {
            None => Ok(value),
            Some(bitfield) => Ok(codec::extract_bitfield(value, self.vartype, bitfield)),
        }
    }

    /// Encode a value for writing
    ///
    /// For bitfields, `previous` must hold the last raw memory content; only
    /// the bits of the field are replaced.
    pub fn encode(&self, value: f64, previous: Option<&[u8]>) -> Result<Vec<u8>> {
        let Some(bitfield) = self.bitfield else {
            return codec::encode(self.vartype, value, self.endianness);
        };
        let previous = previous.ok_or_else(|| {
            WatchError::OperationFailure(format!(
                "{}: cannot write a bitfield before its memory was read",
                self.fullname()
            ))
        })?;
        let whole = codec::decode_bits(self.vartype, previous, self.endianness)?;
        let field = codec::clamp_to_bitfield(value, self.vartype, bitfield);
        let mask = codec::bitmask(bitfield.size) << bitfield.offset;
        let merged = (whole & !mask) | ((field << bitfield.offset) & mask);
        codec::encode_bits(self.vartype, merged, self.endianness)
    }
}

/// Path prefix of runtime published values
pub const RPV_PATH_PREFIX: &str = "/rpv/x";

/// A value published by the device under a numeric ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimePublishedValue {
    pub id: u16,
    pub datatype: VariableType,
}

impl RuntimePublishedValue {
    pub fn new(id: u16, datatype: VariableType) -> Self {
        Self { id, datatype }
    }

    /// Tree path of this RPV
    pub fn path(&self) -> String {
        rpv_path(self.id)
    }
}

/// Tree path of an RPV, e.g. `/rpv/x1234`
pub fn rpv_path(id: u16) -> String {
    format!("{}{:04X}", RPV_PATH_PREFIX, id)
}

/// Extract the RPV ID from a path such as `/rpv/x1234`
pub fn parse_rpv_path(path: &str) -> Option<u16> {
    let hex = path.strip_prefix(RPV_PATH_PREFIX)?;
    if hex.is_empty() || hex.len() > 4 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

pub fn is_rpv_path(path: &str) -> bool {
    parse_rpv_path(path).is_some()
}

/// How the registry interprets a leaf
///
/// Immutable once created; the registry hands out shared references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchableConfiguration {
    pub watchable_type: WatchableType,
    pub datatype: VariableType,
    pub server_id: ServerId,
    #[serde(default)]
    pub enum_def: Option<EnumDef>,
}

impl WatchableConfiguration {
    pub fn new(
        watchable_type: WatchableType,
        datatype: VariableType,
        server_id: impl Into<ServerId>,
    ) -> Self {
        Self {
            watchable_type,
            datatype,
            server_id: server_id.into(),
            enum_def: None,
        }
    }

    pub fn with_enum(mut self, enum_def: EnumDef) -> Self {
        self.enum_def = Some(enum_def);
        self
    }
}

/// A new value for one watchable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueUpdate {
    pub server_id: ServerId,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

impl ValueUpdate {
    pub fn new(server_id: impl Into<ServerId>, value: Value) -> Self {
        Self {
            server_id: server_id.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}
