//! Process configuration and logging setup.
//!
//! Settings come from the environment:
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | `sqlite://classroom_scores.db` |
//! | `BIND_ADDR` | `0.0.0.0:8000` |
//! | `CHART_FONT` | unset (bundled DejaVu Sans) |
//! | `RUST_LOG` | `classroom_scores=info,tower_http=info` |

use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://classroom_scores.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_LOG_FILTER: &str = "classroom_scores=info,tower_http=info";

static TRACING: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Connection string for the backing store
    pub database_url: String,
    /// Address the API server listens on
    pub bind_addr: String,
    /// TrueType font for chart labels
    pub chart_font: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            chart_font: None,
        }
    }
}

impl AppConfig {
    /// Read settings from the process environment, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            chart_font: get("CHART_FONT").map(PathBuf::from),
        }
    }
}

/// Install the global tracing subscriber. Later calls are no-ops.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let config = AppConfig::from_lookup(|_| None);
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.database_url, "sqlite://classroom_scores.db");
    }

    #[test]
    fn test_values_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "sqlite:///tmp/scores.db"),
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("CHART_FONT", "/fonts/Sans.ttf"),
        ]);
        let config = AppConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_url, "sqlite:///tmp/scores.db");
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.chart_font, Some(PathBuf::from("/fonts/Sans.ttf")));
    }

    #[test]
    fn test_blank_values_fall_back() {
        let config = AppConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
    }
}
