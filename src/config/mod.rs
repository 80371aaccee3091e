mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BridgeSettings, BrokerSettings, ServerSettings, Settings, StorageSettings, TransferSettings,
};

/// Prefix of environment overrides, e.g. `POPCAST__SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "POPCAST";

/// Loads the configuration from `config/default.*` (optional) and
/// `POPCAST__SECTION__KEY` environment variables, then merges it over the
/// defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
