use axum::http::HeaderValue;
use chrono::FixedOffset;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::submission::EmailAddress;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} env var must be set")]
    Missing(&'static str),
    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    Plain,
    StartTls,
    Tls,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub server: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub username: String,
    pub password: String,
    pub sender: EmailAddress,
    pub from_name: String,
    pub rcpt: EmailAddress,
    pub subject: String,
    pub template: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GeoConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub origins: Vec<HeaderValue>,
    pub log_level: LevelFilter,
    pub log_file: PathBuf,
    pub database_url: String,
    pub utc_offset: FixedOffset,
    pub mail: MailConfig,
    pub geo: GeoConfig,
}

impl ServerConfig {
    /// Reads every setting from the process environment, `.env` included.
    pub fn from_env() -> Result<ServerConfig, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<ServerConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let starttls = env.parse_or("MAIL_STARTTLS", "true", parse_bool)?;
        let ssl_tls = env.parse_or("MAIL_SSL_TLS", "false", parse_bool)?;
        let security = match (starttls, ssl_tls) {
            (true, true) => {
                return Err(ConfigError::Invalid {
                    name: "MAIL_SSL_TLS",
                    value: "true".into(),
                    reason: "MAIL_STARTTLS and MAIL_SSL_TLS are mutually exclusive".into(),
                })
            }
            (true, false) => SmtpSecurity::StartTls,
            (false, true) => SmtpSecurity::Tls,
            (false, false) => SmtpSecurity::Plain,
        };

        let sender: EmailAddress = env.parse("SENDER_EMAIL", parse_address)?;
        let mail = MailConfig {
            server: env.required("MAIL_SERVER")?,
            port: env.parse("MAIL_PORT", parse_num)?,
            security,
            username: env
                .optional("MAIL_USERNAME")
                .unwrap_or_else(|| sender.to_string()),
            password: env.required("MAIL_PASSWORD")?,
            sender,
            from_name: env.required("MAIL_FROM_NAME")?,
            rcpt: env.parse("RECEIVER_EMAIL", parse_address)?,
            subject: env.required("EMAIL_SUBJECT")?,
            template: env.required("EMAIL_TEMPLATE")?,
            timeout: env.parse_or("MAIL_TIMEOUT_SECS", "60", parse_secs)?,
        };

        let geo = GeoConfig {
            base_url: env
                .optional("GEOLOCATION_URL")
                .unwrap_or_else(|| "https://api.db-ip.com/v2".into())
                .trim_end_matches('/')
                .to_string(),
            api_key: env
                .optional("GEOLOCATION_API_KEY")
                .unwrap_or_else(|| "free".into()),
            timeout: env.parse_or("GEOLOCATION_TIMEOUT_SECS", "5", parse_secs)?,
        };

        Ok(ServerConfig {
            host: env
                .optional("SERVER_HOST")
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: env.parse_or("SERVER_PORT", "8000", parse_num)?,
            origins: env.parse("ORIGINS", parse_origins)?,
            log_level: env.parse("LOGGING_LEVEL", parse_level)?,
            log_file: PathBuf::from(env.required("LOG_FILE_PATH")?),
            database_url: env.required("DATABASE_URL")?,
            utc_offset: env.parse_or("SUBMISSION_UTC_OFFSET", "+05:30", parse_offset)?,
            mail,
            geo,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, name: &'static str) -> Option<String> {
        (self.lookup)(name)
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn parse<T>(
        &self,
        name: &'static str,
        parse: fn(&str) -> Result<T, String>,
    ) -> Result<T, ConfigError> {
        let value = self.required(name)?;
        convert(name, value, parse)
    }

    /// Defaults go through the same parser as configured values.
    fn parse_or<T>(
        &self,
        name: &'static str,
        default: &str,
        parse: fn(&str) -> Result<T, String>,
    ) -> Result<T, ConfigError> {
        let value = self.optional(name).unwrap_or_else(|| default.to_string());
        convert(name, value, parse)
    }
}

fn convert<T>(
    name: &'static str,
    value: String,
    parse: fn(&str) -> Result<T, String>,
) -> Result<T, ConfigError> {
    parse(&value).map_err(|reason| ConfigError::Invalid {
        name,
        value,
        reason,
    })
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| e.to_string())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected true or false".into()),
    }
}

fn parse_secs(value: &str) -> Result<Duration, String> {
    let secs: u64 = parse_num(value)?;
    if secs == 0 {
        return Err("timeout must be at least one second".into());
    }
    Ok(Duration::from_secs(secs))
}

fn parse_address(value: &str) -> Result<EmailAddress, String> {
    EmailAddress::parse(value).map_err(|e| e.to_string())
}

fn parse_offset(value: &str) -> Result<FixedOffset, String> {
    value
        .trim()
        .parse::<FixedOffset>()
        .map_err(|e| format!("expected an offset like +05:30 ({e})"))
}

/// Origins are separated by ", " in deployment files; stray whitespace is tolerated.
fn parse_origins(value: &str) -> Result<Vec<HeaderValue>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(|origin| HeaderValue::from_str(origin).map_err(|e| format!("{origin}: {e}")))
        .collect()
}

/// Numeric levels (10 debug, 20 info, 30 warning, 40 error) are accepted as well as names.
fn parse_level(value: &str) -> Result<LevelFilter, String> {
    let value = value.trim();
    if let Ok(n) = value.parse::<u32>() {
        return Ok(match n {
            0..=9 => LevelFilter::TRACE,
            10..=19 => LevelFilter::DEBUG,
            20..=29 => LevelFilter::INFO,
            30..=39 => LevelFilter::WARN,
            _ => LevelFilter::ERROR,
        });
    }
    match value.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" | "critical" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        _ => Err("unknown logging level".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("SENDER_EMAIL", "forms@example.com"),
            ("MAIL_PASSWORD", "hunter2"),
            ("MAIL_PORT", "587"),
            ("MAIL_SERVER", "smtp.example.com"),
            ("MAIL_FROM_NAME", "Website"),
            ("ORIGINS", "https://example.com, http://localhost:3000"),
            ("LOGGING_LEVEL", "20"),
            ("LOG_FILE_PATH", "logs/form.log"),
            ("EMAIL_TEMPLATE", "<p>{user_name}</p>"),
            ("EMAIL_SUBJECT", "New contact form entry"),
            ("RECEIVER_EMAIL", "owner@example.com"),
            ("DATABASE_URL", "sqlite::memory:"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<ServerConfig, ConfigError> {
        ServerConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn loads_required_settings_with_defaults() {
        let config = load(&base()).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.origins.len(), 2);
        assert_eq!(config.origins[1], "http://localhost:3000");
        assert_eq!(config.log_level, LevelFilter::INFO);
        assert_eq!(config.utc_offset.local_minus_utc(), 19800);
        assert_eq!(config.mail.security, SmtpSecurity::StartTls);
        assert_eq!(config.mail.username, "forms@example.com");
        assert_eq!(config.mail.timeout, Duration::from_secs(60));
        assert_eq!(config.geo.base_url, "https://api.db-ip.com/v2");
        assert_eq!(config.geo.api_key, "free");
    }

    #[test]
    fn every_required_setting_is_checked() {
        for name in base().keys() {
            let mut vars = base();
            vars.remove(name);
            match load(&vars) {
                Err(ConfigError::Missing(missing)) => assert_eq!(missing, *name),
                other => panic!("{name}: expected missing error, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_bad_values() {
        let mut vars = base();
        vars.insert("MAIL_PORT", "smtp");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid { name: "MAIL_PORT", .. })
        ));

        let mut vars = base();
        vars.insert("RECEIVER_EMAIL", "not-an-address");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid { name: "RECEIVER_EMAIL", .. })
        ));

        let mut vars = base();
        vars.insert("MAIL_SSL_TLS", "true");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn security_modes() {
        let mut vars = base();
        vars.insert("MAIL_STARTTLS", "false");
        vars.insert("MAIL_SSL_TLS", "true");
        assert_eq!(load(&vars).unwrap().mail.security, SmtpSecurity::Tls);

        vars.insert("MAIL_SSL_TLS", "false");
        assert_eq!(load(&vars).unwrap().mail.security, SmtpSecurity::Plain);
    }

    #[test]
    fn logging_levels() {
        assert_eq!(parse_level("10").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("40").unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_level("50").unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_level("WARNING").unwrap(), LevelFilter::WARN);
        assert!(parse_level("loud").is_err());
    }
}
