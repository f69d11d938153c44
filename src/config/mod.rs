mod settings;

pub use settings::{
    EngineConfig, PermissionsConfig, Settings, TelemetryConfig, VariableStoreConfig,
};
