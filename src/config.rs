use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::completion::{CompletionOptions, ResponseFormat};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo-1106";

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Provider credential. When absent the server still starts but
    /// `/query` answers 500.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub completion_timeout_ms: u64,
    pub port: u16,
    /// Expose `details` in error envelopes.
    pub dev_mode: bool,
    pub static_dir: PathBuf,
    pub max_request_bytes: Option<usize>,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 1000,
            temperature: 0.7,
            completion_timeout_ms: 30_000,
            port: 3000,
            dev_mode: false,
            static_dir: PathBuf::from("public"),
            max_request_bytes: None,
            log_file: None,
            rotation: RotationConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let api_key = non_empty_var("OPENAI_API_KEY");
        let base_url = non_empty_var("OPENAI_BASE_URL").unwrap_or(defaults.base_url);
        let model = non_empty_var("OPENAI_MODEL").unwrap_or(defaults.model);
        let max_tokens = match parse_optional_u64("OPENAI_MAX_TOKENS")? {
            Some(v) => u32::try_from(v).map_err(|_| anyhow!("OPENAI_MAX_TOKENS is too large"))?,
            None => defaults.max_tokens,
        };
        let temperature = parse_optional_f32("OPENAI_TEMPERATURE")?.unwrap_or(defaults.temperature);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(anyhow!("OPENAI_TEMPERATURE must be between 0 and 2"));
        }
        let completion_timeout_ms = parse_optional_u64("WORDROOT_COMPLETION_TIMEOUT_MS")?
            .filter(|ms| *ms > 0)
            .unwrap_or(defaults.completion_timeout_ms);
        let port = match parse_optional_u64("PORT")? {
            Some(v) => u16::try_from(v).map_err(|_| anyhow!("PORT must be a valid TCP port"))?,
            None => defaults.port,
        };

        // WORDROOT_DEV_ERRORS wins over APP_ENV when both are set.
        let dev_mode = match parse_bool_env("WORDROOT_DEV_ERRORS")? {
            Some(flag) => flag,
            None => non_empty_var("APP_ENV")
                .map(|v| v.trim().eq_ignore_ascii_case("development"))
                .unwrap_or(false),
        };

        let static_dir = non_empty_var("WORDROOT_STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.static_dir);
        let max_request_bytes =
            parse_optional_u64("WORDROOT_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        let log_file = non_empty_var("LOG_FILE");
        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            api_key,
            base_url,
            model,
            max_tokens,
            temperature,
            completion_timeout_ms,
            port,
            dev_mode,
            static_dir,
            max_request_bytes,
            log_file,
            rotation,
        })
    }

    pub fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: ResponseFormat::JsonObject,
        }
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_f32(var: &str) -> Result<Option<f32>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a number", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: [&str; 15] = [
        "OPENAI_API_KEY",
        "OPENAI_BASE_URL",
        "OPENAI_MODEL",
        "OPENAI_MAX_TOKENS",
        "OPENAI_TEMPERATURE",
        "WORDROOT_COMPLETION_TIMEOUT_MS",
        "PORT",
        "APP_ENV",
        "WORDROOT_DEV_ERRORS",
        "WORDROOT_STATIC_DIR",
        "WORDROOT_MAX_REQUEST_BYTES",
        "LOG_FILE",
        "LOG_MAX_BYTES",
        "LOG_ROTATE_KEEP",
        "LOG_ROTATE_COMPRESS",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.api_key.is_none());
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.model, DEFAULT_MODEL);
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.completion_timeout_ms, 30_000);
        assert!(!cfg.dev_mode);
        assert_eq!(cfg.static_dir, PathBuf::from("public"));
        assert_eq!(cfg.rotation.keep, 1);
        assert!(cfg.log_file.is_none());
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        std::env::set_var("OPENAI_API_KEY", "sk-test");
        std::env::set_var("OPENAI_BASE_URL", "http://127.0.0.1:9999/v1");
        std::env::set_var("OPENAI_MODEL", "gpt-4o-mini");
        std::env::set_var("OPENAI_MAX_TOKENS", "512");
        std::env::set_var("OPENAI_TEMPERATURE", "0.2");
        std::env::set_var("WORDROOT_COMPLETION_TIMEOUT_MS", "1500");
        std::env::set_var("PORT", "8081");
        std::env::set_var("APP_ENV", "Development");
        std::env::set_var("WORDROOT_STATIC_DIR", "/srv/wordroot");
        std::env::set_var("WORDROOT_MAX_REQUEST_BYTES", "2048");
        std::env::set_var("LOG_FILE", "/tmp/wordroot.log");
        std::env::set_var("LOG_MAX_BYTES", "1024");
        std::env::set_var("LOG_ROTATE_KEEP", "5");
        std::env::set_var("LOG_ROTATE_COMPRESS", "true");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.base_url, "http://127.0.0.1:9999/v1");
        assert_eq!(cfg.max_tokens, 512);
        assert!((cfg.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(cfg.completion_timeout(), Duration::from_millis(1500));
        assert_eq!(cfg.port, 8081);
        assert!(cfg.dev_mode);
        assert_eq!(cfg.static_dir, PathBuf::from("/srv/wordroot"));
        assert_eq!(cfg.max_request_bytes, Some(2048));
        assert_eq!(cfg.log_file.as_deref(), Some("/tmp/wordroot.log"));
        assert_eq!(cfg.rotation.max_bytes, Some(1024));
        assert_eq!(cfg.rotation.keep, 5);
        assert!(cfg.rotation.compress);

        let opts = cfg.completion_options();
        assert_eq!(opts.model, "gpt-4o-mini");
        assert_eq!(opts.response_format, ResponseFormat::JsonObject);

        clear();
    }

    #[test]
    fn dev_errors_flag_overrides_app_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("APP_ENV", "development");
        std::env::set_var("WORDROOT_DEV_ERRORS", "off");
        assert!(!AppConfig::from_env().unwrap().dev_mode);

        std::env::set_var("APP_ENV", "production");
        std::env::set_var("WORDROOT_DEV_ERRORS", "1");
        assert!(AppConfig::from_env().unwrap().dev_mode);
        clear();
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("OPENAI_API_KEY", "   ");
        assert!(AppConfig::from_env().unwrap().api_key.is_none());
        clear();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("PORT", "70000");
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PORT"));
        std::env::remove_var("PORT");

        std::env::set_var("OPENAI_TEMPERATURE", "hot");
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("OPENAI_TEMPERATURE"));
        std::env::set_var("OPENAI_TEMPERATURE", "3.5");
        assert!(AppConfig::from_env().is_err());
        clear();
    }
}
