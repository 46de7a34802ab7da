use std::env;
use std::str::FromStr;
use std::time::Duration;
use log::warn;

// Server Configuration
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:3000";
pub const STATS_INTERVAL_SECS: u64 = 60;

// Storage Configuration
pub const DEFAULT_STORE_URL: &str = "sqlite://signals.db";
pub const MEMORY_STORE_URL: &str = "memory";
pub const DEFAULT_PERSIST_WINDOW_SECS: u64 = 60;

// Generation Configuration
pub const DEFAULT_TICK_MIN_MS: u64 = 5_000;
pub const DEFAULT_TICK_MAX_MS: u64 = 10_000;

// Connection Configuration
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub api_bind_address: String,
    pub store_url: String,
    pub log_level: String,
    pub persist_window_secs: u64,
    pub tick_min_ms: u64,
    pub tick_max_ms: u64,
    pub outbound_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            api_bind_address: DEFAULT_API_BIND_ADDRESS.to_string(),
            store_url: DEFAULT_STORE_URL.to_string(),
            log_level: "info".to_string(),
            persist_window_secs: DEFAULT_PERSIST_WINDOW_SECS,
            tick_min_ms: DEFAULT_TICK_MIN_MS,
            tick_max_ms: DEFAULT_TICK_MAX_MS,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_API_BIND_ADDRESS.to_string()),
            store_url: env::var("STORE_URL")
                .unwrap_or_else(|_| DEFAULT_STORE_URL.to_string()),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "info".to_string()),
            persist_window_secs: parse_env("PERSIST_WINDOW_SECS", DEFAULT_PERSIST_WINDOW_SECS),
            tick_min_ms: parse_env("TICK_MIN_MS", DEFAULT_TICK_MIN_MS),
            tick_max_ms: parse_env("TICK_MAX_MS", DEFAULT_TICK_MAX_MS),
            outbound_queue_size: parse_env("OUTBOUND_QUEUE_SIZE", DEFAULT_OUTBOUND_QUEUE_SIZE),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bind_address.trim().is_empty() || self.api_bind_address.trim().is_empty() {
            return Err("Bind addresses cannot be empty".to_string());
        }

        if self.tick_min_ms == 0 {
            return Err("TICK_MIN_MS must be greater than 0".to_string());
        }

        if self.tick_min_ms > self.tick_max_ms {
            return Err(format!(
                "TICK_MIN_MS ({}) cannot exceed TICK_MAX_MS ({})",
                self.tick_min_ms, self.tick_max_ms
            ));
        }

        if self.persist_window_secs == 0 {
            return Err("PERSIST_WINDOW_SECS must be greater than 0".to_string());
        }

        if self.outbound_queue_size == 0 {
            return Err("OUTBOUND_QUEUE_SIZE must be greater than 0".to_string());
        }

        if self.store_url == MEMORY_STORE_URL {
            warn!("Using in-memory signal store - persisted signals are lost on restart");
        }

        Ok(())
    }

    pub fn tick_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.tick_min_ms),
            Duration::from_millis(self.tick_max_ms),
        )
    }

    pub fn persist_window(&self) -> Duration {
        Duration::from_secs(self.persist_window_secs)
    }

    pub fn log_config(&self) {
        println!("Server Configuration:");
        println!("  WebSocket Address: {}", self.bind_address);
        println!("  API Address: {}", self.api_bind_address);
        println!("  Store: {}", self.store_url);
        println!("  Log Level: {}", self.log_level);
        println!("  Persist Window: {}s", self.persist_window_secs);
        println!("  Tick Range: {}-{}ms", self.tick_min_ms, self.tick_max_ms);
        println!("  Outbound Queue: {}", self.outbound_queue_size);
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: {:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.persist_window(), Duration::from_secs(60));
        assert_eq!(
            config.tick_range(),
            (Duration::from_secs(5), Duration::from_secs(10))
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.tick_min_ms = 20_000;
        assert!(config.validate().is_err());

        config = Config::default();
        config.tick_min_ms = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.persist_window_secs = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.outbound_queue_size = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.bind_address = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_falls_back_on_garbage() {
        env::set_var("SIGNAL_SOCKET_TEST_GARBAGE", "not-a-number");
        assert_eq!(parse_env("SIGNAL_SOCKET_TEST_GARBAGE", 42u64), 42);
        env::set_var("SIGNAL_SOCKET_TEST_NUMBER", " 7 ");
        assert_eq!(parse_env("SIGNAL_SOCKET_TEST_NUMBER", 42u64), 7);
        assert_eq!(parse_env("SIGNAL_SOCKET_TEST_UNSET", 3usize), 3);
    }
}
