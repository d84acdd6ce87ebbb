use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `BAYKEEPER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "baykeeper".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|s| s.trim().parse().ok())
        }

        let defaults = Self::default();
        Self {
            bind: lookup("BAYKEEPER_BIND").unwrap_or(defaults.bind),
            port: parsed(lookup("BAYKEEPER_PORT")).unwrap_or(defaults.port),
            data_dir: lookup("BAYKEEPER_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("BAYKEEPER_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(lookup("BAYKEEPER_MAX_CONNECTIONS"))
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(lookup("BAYKEEPER_COMPACT_THRESHOLD"))
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(lookup("BAYKEEPER_METRICS_PORT")),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("baykeeper.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/baykeeper.wal"));
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("BAYKEEPER_BIND", "127.0.0.1"),
            ("BAYKEEPER_PORT", "6543"),
            ("BAYKEEPER_DATA_DIR", "/var/lib/baykeeper"),
            ("BAYKEEPER_PASSWORD", "s3cret"),
            ("BAYKEEPER_MAX_CONNECTIONS", "16"),
            ("BAYKEEPER_COMPACT_THRESHOLD", "50"),
            ("BAYKEEPER_METRICS_PORT", "9100"),
        ]));
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/baykeeper"));
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("BAYKEEPER_PORT", "not-a-port"),
            ("BAYKEEPER_MAX_CONNECTIONS", "-3"),
            ("BAYKEEPER_METRICS_PORT", "99999"),
        ]));
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
    }
}
