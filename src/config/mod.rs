mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    GossipSettings, LoggingSettings, ServerSettings, Settings, StorageSettings, WorkerSettings,
};

/// Loads the configuration from `config/default.*` and `POPMESH__*` environment
/// variables, merged over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("POPMESH")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.peers")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let settings = partial.merge(Settings::default());

    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let p = settings.gossip.stop_probability;
    if !(0.0..=1.0).contains(&p) {
        return Err(ConfigError::Message(format!(
            "gossip.stop_probability must lie in [0, 1], got {p}"
        )));
    }
    if settings.gossip.rumor_batch_size == 0 {
        return Err(ConfigError::Message(
            "gossip.rumor_batch_size must be at least 1".to_string(),
        ));
    }
    if settings.workers.pool_size == 0 {
        return Err(ConfigError::Message(
            "workers.pool_size must be at least 1".to_string(),
        ));
    }
    Ok(())
}
