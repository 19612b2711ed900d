//! Configuration module.
//!
//! Handles engine settings loaded from TOML.

mod settings;

pub use settings::{
    AliasSettings, EngineSettings, PaginationSettings, PrefetchSettings, SettingsError,
    MAX_ALIAS_LENGTH, MIN_ALIAS_LENGTH,
};
