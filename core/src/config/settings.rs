use super::BrokerConfig;
use crate::Result;
use config::{Config, Environment, File};

impl BrokerConfig {
    /// Build a configuration from `RILLMQ_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Layer an optional TOML file and then `RILLMQ_*` environment variables over
    /// the defaults.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path));
        }

        let settings = builder
            .add_source(Environment::with_prefix("RILLMQ").try_parsing(true))
            .build()
            .map_err(|e| crate::RillmqError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<BrokerConfig>()
            .map_err(|e| crate::RillmqError::Config(e.to_string()))?;

        config.validate().map_err(crate::RillmqError::Config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_toml_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "tcp_address = \"127.0.0.1:4999\"").unwrap();
        writeln!(file, "max_rdy_count = 100").unwrap();

        let config = BrokerConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.tcp_address, "127.0.0.1:4999");
        assert_eq!(config.max_rdy_count, 100);
        assert_eq!(config.msg_timeout_ms, BrokerConfig::default().msg_timeout_ms);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_rdy_count = 0").unwrap();

        let err = BrokerConfig::load(Some(file.path().to_str().unwrap())).unwrap_err();
        assert!(err.to_string().contains("max_rdy_count"));
    }
}
