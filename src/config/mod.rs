pub mod schema;

pub use schema::{
    config_json_schema, resolve_config_dir, AuthConfig, AuthMode, BrokerConfig, Config,
    LoggingConfig, PagerConfig, TimeoutsConfig, LOG_FILE_ENV,
};
