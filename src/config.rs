use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use http::{header::InvalidHeaderValue, HeaderValue};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 4000)]
    pub port: u16,
    /// Interface to bind
    #[arg(long, env = "HOST", default_value_t = String::from("0.0.0.0"))]
    pub host: String,
    /// SQLite database path, created if missing
    #[arg(short, long, env = "DATABASE_URL")]
    pub database_url: String,
    /// Allowed browser origins, `*` or a comma separated list
    #[arg(long, env = "CORS_ORIGIN", default_value = "*")]
    pub cors_origin: CorsOrigin,
    /// Secret required for bulk delete. Unset or empty leaves delete open
    #[arg(long, env = "ADMIN_KEY", hide_env_values = true)]
    admin_key: Option<String>,
    /// Log to file
    #[arg(short, long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
    /// Database connection pool size
    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 8)]
    pub pool_size: u32,
}

impl Config {
    pub fn admin_key(&self) -> Option<&str> {
        self.admin_key.as_deref().filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorsOrigin {
    Any,
    List(Vec<HeaderValue>),
}

impl FromStr for CorsOrigin {
    type Err = InvalidHeaderValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(CorsOrigin::Any);
        }

        s.split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(HeaderValue::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(CorsOrigin::List)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["prediction-board", "--database-url", "a.db"]).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.database_url, "a.db");
        assert_eq!(config.cors_origin, CorsOrigin::Any);
        assert_eq!(config.pool_size, 8);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn database_is_required() {
        if std::env::var_os("DATABASE_URL").is_none() {
            assert!(Config::try_parse_from(["prediction-board"]).is_err());
        }
    }

    #[rstest]
    #[case(&[], None)]
    #[case(&["--admin-key", ""], None)]
    #[case(&["--admin-key", "hunter2"], Some("hunter2"))]
    fn empty_admin_key_counts_as_unset(#[case] extra: &[&str], #[case] expected: Option<&str>) {
        let args = ["prediction-board", "--database-url", "a.db"]
            .iter()
            .chain(extra)
            .copied();
        let config = Config::try_parse_from(args).unwrap();
        assert_eq!(config.admin_key(), expected);
    }

    #[rstest]
    #[case("*", CorsOrigin::Any)]
    #[case("", CorsOrigin::Any)]
    #[case(
        "https://a.example, https://b.example,",
        CorsOrigin::List(vec![
            HeaderValue::from_static("https://a.example"),
            HeaderValue::from_static("https://b.example"),
        ])
    )]
    fn cors_origin_parsing(#[case] raw: &str, #[case] expected: CorsOrigin) {
        assert_eq!(raw.parse::<CorsOrigin>().unwrap(), expected);
    }

    #[test]
    fn cors_origin_rejects_control_characters() {
        assert!("https://a.example\n".parse::<CorsOrigin>().is_ok());
        assert!("https://a\u{7f}.example".parse::<CorsOrigin>().is_err());
    }
}
