use std::time::Duration;

use crate::services::proximity::DEFAULT_THRESHOLD_KM;
use crate::services::sources::{SourceConfig, SourceKind};

/// Hourly constellation frames published by Windborne (00.json .. 23.json).
const MAX_WINDBORNE_HOURS: u32 = 24;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("timeouts must satisfy source timeout < fetch deadline < every TTL: {0}")]
    TimeoutOrdering(String),
    #[error("no {0} sources configured")]
    NoSources(&'static str),
}

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Sent on every upstream request (api.weather.gov rejects requests without one).
    pub user_agent: String,
    pub windborne_base_url: String,
    /// Number of hourly frames to fetch; 0 disables the Windborne feed.
    pub windborne_hours: u32,
    /// Extra trajectory feeds in this service's own wire shape.
    pub trajectory_feed_urls: Vec<String>,
    /// GeoJSON alert feeds.
    pub hazard_feed_urls: Vec<String>,
    pub trajectory_ttl_secs: u64,
    pub hazard_ttl_secs: u64,
    pub source_timeout_secs: u64,
    pub fetch_deadline_secs: u64,
    pub threshold_km: f64,
    /// Keep caches warm from a background task.
    pub refresh_ahead: bool,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, then validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_var(&lookup, "PORT", 8080)?,
            user_agent: lookup("UPSTREAM_USER_AGENT").unwrap_or_else(|| {
                "HurricaneHunter/0.1 (hurricane-hunter-api)".to_string()
            }),
            windborne_base_url: lookup("WINDBORNE_BASE_URL")
                .unwrap_or_else(|| "https://a.windbornesystems.com/treasure/".to_string()),
            windborne_hours: parse_var(&lookup, "WINDBORNE_HOURS", MAX_WINDBORNE_HOURS)?,
            trajectory_feed_urls: split_list(lookup("TRAJECTORY_FEED_URLS").as_deref()),
            hazard_feed_urls: match lookup("HAZARD_FEED_URLS") {
                Some(urls) => split_list(Some(&urls)),
                None => vec!["https://api.weather.gov/alerts/active".to_string()],
            },
            trajectory_ttl_secs: parse_var(&lookup, "TRAJECTORY_TTL_SECS", 600)?,
            hazard_ttl_secs: parse_var(&lookup, "HAZARD_TTL_SECS", 300)?,
            source_timeout_secs: parse_var(&lookup, "SOURCE_TIMEOUT_SECS", 10)?,
            fetch_deadline_secs: parse_var(&lookup, "FETCH_DEADLINE_SECS", 15)?,
            threshold_km: parse_var(&lookup, "MONITORING_THRESHOLD_KM", DEFAULT_THRESHOLD_KM)?,
            refresh_ahead: parse_var(&lookup, "REFRESH_AHEAD", false)?,
            log_json: lookup("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.windborne_hours > MAX_WINDBORNE_HOURS {
            return Err(ConfigError::Invalid {
                var: "WINDBORNE_HOURS",
                value: self.windborne_hours.to_string(),
                reason: format!("at most {} hourly frames exist", MAX_WINDBORNE_HOURS),
            });
        }
        if !self.threshold_km.is_finite() || self.threshold_km < 0.0 {
            return Err(ConfigError::Invalid {
                var: "MONITORING_THRESHOLD_KM",
                value: self.threshold_km.to_string(),
                reason: "must be a finite, non-negative number".to_string(),
            });
        }

        let min_ttl = self.trajectory_ttl_secs.min(self.hazard_ttl_secs);
        if self.source_timeout_secs >= self.fetch_deadline_secs
            || self.fetch_deadline_secs >= min_ttl
        {
            return Err(ConfigError::TimeoutOrdering(format!(
                "{}s / {}s / {}s",
                self.source_timeout_secs, self.fetch_deadline_secs, min_ttl
            )));
        }

        if self.windborne_hours == 0 && self.trajectory_feed_urls.is_empty() {
            return Err(ConfigError::NoSources("trajectory"));
        }
        if self.hazard_feed_urls.is_empty() {
            return Err(ConfigError::NoSources("hazard"));
        }
        Ok(())
    }

    pub fn trajectory_sources(&self) -> Vec<SourceConfig> {
        let mut sources =
            SourceConfig::windborne_history(&self.windborne_base_url, self.windborne_hours);
        sources.extend(self.trajectory_feed_urls.iter().enumerate().map(|(i, url)| {
            SourceConfig::new(format!("trajectory-feed-{}", i), url, SourceKind::TrajectoryFeed)
        }));
        sources
    }

    pub fn hazard_sources(&self) -> Vec<SourceConfig> {
        self.hazard_feed_urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                SourceConfig::new(format!("alerts-{}", i), url, SourceKind::GeoJsonAlerts)
            })
            .collect()
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }

    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_secs(self.fetch_deadline_secs)
    }

    pub fn trajectory_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.trajectory_ttl_secs as i64)
    }

    pub fn hazard_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hazard_ttl_secs as i64)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
