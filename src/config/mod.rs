pub mod schema;

pub use schema::{BridgeConfig, Config, GatewayConfig, CONFIG_DIR_ENV};
