use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: String,
    /// Schedule follow-up steps in the background after each trigger.
    pub auto_continue: bool,
    pub max_active_steps: usize,
    /// Core configuration file; falls back to `DEEPDIVE_CONFIG` and defaults.
    pub config_path: Option<PathBuf>,
    pub json_logs: bool,
}

impl AppConfig {
    const DEFAULT_LISTEN_ADDR: &'static str = "0.0.0.0:8080";

    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("DEEPDIVE_API_ADDR")
            .unwrap_or_else(|_| Self::DEFAULT_LISTEN_ADDR.to_string());

        let auto_continue = match env::var("DEEPDIVE_AUTO_CONTINUE") {
            Ok(value) => parse_bool(&value)
                .with_context(|| "DEEPDIVE_AUTO_CONTINUE must be true or false")?,
            Err(_) => true,
        };

        let max_active_steps = env::var("DEEPDIVE_MAX_ACTIVE_STEPS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|nz| nz.get())
                    .unwrap_or(4)
            });

        let config_path = env::var("DEEPDIVE_API_CONFIG")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let json_logs = env::var("DEEPDIVE_LOG_JSON")
            .ok()
            .and_then(|value| parse_bool(&value))
            .unwrap_or(false);

        Ok(Self {
            listen_addr,
            auto_continue,
            max_active_steps,
            config_path,
            json_logs,
        })
    }
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
