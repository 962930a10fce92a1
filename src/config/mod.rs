// src/config/mod.rs
pub mod sync;

pub use sync::{
    AlertsCfg, CanonicalCfg, DigestCfg, HttpCfg, ScheduleCfg, ScheduleClass, Secrets, SourceDef,
    SyncConfig, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH,
};
