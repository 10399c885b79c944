//! Test data builders for creating test objects

use watchlink_rs::registry::WatchableRegistry;
use watchlink_rs::types::{
    Endianness, RuntimePublishedValue, Variable, VariableLocation, VariableType,
    WatchableConfiguration, WatchableType,
};
use watchlink_rs::{AliasDefinition, ValuePipeline};

/// Builder for creating test Variables
pub struct VariableBuilder {
    name: String,
    path: Vec<String>,
    address: u64,
    var_type: VariableType,
    endianness: Endianness,
    bitfield: Option<(u32, u32)>,
}

impl VariableBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: Vec::new(),
            address: 0x2000_0000,
            var_type: VariableType::Uint32,
            endianness: Endianness::Little,
            bitfield: None,
        }
    }

    pub fn path(mut self, segments: &[&str]) -> Self {
        self.path = segments.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    pub fn var_type(mut self, var_type: VariableType) -> Self {
        self.var_type = var_type;
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.endianness = Endianness::Big;
        self
    }

    pub fn bitfield(mut self, offset: u32, size: u32) -> Self {
        self.bitfield = Some((offset, size));
        self
    }

    pub fn build(self) -> Variable {
        let var = Variable::new(
            self.name,
            self.var_type,
            self.path,
            VariableLocation::new(self.address),
            self.endianness,
        );
        match self.bitfield {
            Some((offset, size)) => var
                .with_bitfield(Some(offset), Some(size))
                .expect("valid bitfield"),
            None => var,
        }
    }
}

/// Registry leaf configuration for a float variable
pub fn var_config(server_id: &str) -> WatchableConfiguration {
    WatchableConfiguration::new(WatchableType::Variable, VariableType::Float32, server_id)
}

/// Registry with `/motor/speed`, `/motor/current` and `/status/flags`
/// variables under ids `speed`, `current` and `flags`
pub fn motor_registry() -> WatchableRegistry {
    let registry = WatchableRegistry::new();
    registry
        .add("/motor/speed", WatchableType::Variable, var_config("speed"))
        .unwrap();
    registry
        .add("/motor/current", WatchableType::Variable, var_config("current"))
        .unwrap();
    registry
        .add("/status/flags", WatchableType::Variable, var_config("flags"))
        .unwrap();
    registry
}

/// Pipeline with:
///
/// - `speed`: `/motor/speed`, uint16 little endian
/// - `mode`: `/motor/mode`, 3-bit field at offset 2 of a uint8
/// - `temp`: RPV 0x0010, float32 big endian
/// - `speed_rpm`: alias on `/motor/speed` with gain 0.5 and range [0, 1000]
pub fn motor_pipeline() -> ValuePipeline {
    let mut pipeline = ValuePipeline::new();
    pipeline
        .add_variable(
            "speed",
            VariableBuilder::new("speed")
                .path(&["motor"])
                .var_type(VariableType::Uint16)
                .build(),
        )
        .unwrap();
    pipeline
        .add_variable(
            "mode",
            VariableBuilder::new("mode")
                .path(&["motor"])
                .address(0x2000_0010)
                .var_type(VariableType::Uint8)
                .bitfield(2, 3)
                .build(),
        )
        .unwrap();
    pipeline
        .add_rpv(
            "temp",
            RuntimePublishedValue::new(0x0010, VariableType::Float32),
            Endianness::Big,
        )
        .unwrap();
    let alias = AliasDefinition::new(
        "/alias/speed_rpm",
        "/motor/speed",
        None,
        Some(0.5),
        None,
        Some(0.0),
        Some(1000.0),
    )
    .unwrap();
    pipeline.add_alias("speed_rpm", alias).unwrap();
    pipeline
}
