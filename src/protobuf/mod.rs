//! Generated protobuf modules
//!
//! `build.rs` compiles `protos/meshtastic/*.proto`; prost emits one file per package
//! (`meshtastic.rs`). The subset covers the device stream API (`FromRadio`/`ToRadio`),
//! the packet payloads this crate decodes, and the MQTT `ServiceEnvelope`.

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! Wrapped in a submodule with broad allow() attributes so unused parts of the
    //! schema do not produce warnings.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}

use meshtastic_generated::HardwareModel;

/// Display name for a raw `hw_model` value, e.g. `TBEAM` or `UNKNOWN_77`.
pub fn hardware_model_name(raw: i32) -> String {
    match HardwareModel::try_from(raw) {
        Ok(model) => model.as_str_name().to_string(),
        Err(_) => format!("UNKNOWN_{raw}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_names_follow_schema() {
        assert_eq!(hardware_model_name(4), "TBEAM");
        assert_eq!(hardware_model_name(50), "T_DECK");
        assert_eq!(hardware_model_name(77), "UNKNOWN_77");
    }
}
