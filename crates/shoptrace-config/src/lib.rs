use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// How events carrying neither a session nor a user identifier are bucketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonymousSessionPolicy {
    /// Every fully anonymous event in a call lands in one shared bucket.
    #[default]
    Shared,
    /// Each fully anonymous event gets a freshly minted session id.
    PerEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default)]
    pub anonymous_sessions: AnonymousSessionPolicy,
    #[serde(default = "default_max_session_workers")]
    pub max_session_workers: usize,
    #[serde(default = "default_page_size")]
    pub default_page_size: u16,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            anonymous_sessions: AnonymousSessionPolicy::default(),
            max_session_workers: default_max_session_workers(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_store_path() -> String {
    "~/.shoptrace/shoptrace.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_session_workers() -> usize {
    8
}

fn default_page_size() -> u16 {
    50
}

fn default_max_page_size() -> u16 {
    200
}

pub fn expand_path(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{}", home.to_string_lossy(), stripped);
        }
    }
    path.to_string()
}

fn home_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".shoptrace").join("config.toml"))
}

fn repo_default_config_path() -> PathBuf {
    PathBuf::from("config/shoptrace.toml")
}

fn resolve_config_path_with_overrides(
    raw_path: Option<PathBuf>,
    env_keys: &[&str],
    home_path: Option<PathBuf>,
    repo_default: PathBuf,
) -> PathBuf {
    if let Some(path) = raw_path {
        return path;
    }

    for key in env_keys {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
    }

    if let Some(path) = home_path {
        if path.exists() {
            return path;
        }
    }

    if repo_default.exists() {
        return repo_default;
    }

    home_config_path().unwrap_or(repo_default)
}

pub fn resolve_config_path(raw_path: Option<PathBuf>) -> PathBuf {
    resolve_config_path_with_overrides(
        raw_path,
        &["SHOPTRACE_CONFIG"],
        home_config_path(),
        repo_default_config_path(),
    )
}

fn normalize_config(mut cfg: AppConfig) -> AppConfig {
    cfg.store.path = expand_path(&cfg.store.path);
    cfg.ingest.max_session_workers = cfg.ingest.max_session_workers.max(1);
    cfg.ingest.max_page_size = cfg.ingest.max_page_size.max(1);
    cfg.ingest.default_page_size = cfg
        .ingest
        .default_page_size
        .clamp(1, cfg.ingest.max_page_size);
    cfg
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
    let cfg: AppConfig = toml::from_str(&content).context("failed to parse TOML config")?;
    Ok(normalize_config(cfg))
}

/// Loads the config at `path` when it exists and falls back to defaults otherwise.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<AppConfig> {
    if path.as_ref().exists() {
        load_config(path)
    } else {
        Ok(normalize_config(AppConfig::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp_config(contents: &str, label: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "shoptrace-config-{label}-{}-{}.toml",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system time after unix epoch")
                .as_nanos()
        ));
        std::fs::write(&path, contents).expect("write temp config");
        path
    }

    #[test]
    fn resolve_order_is_cli_then_env_then_home_then_repo() {
        let env_key = "SHOPTRACE_CONFIG_TEST_KEY";
        let home = write_temp_config("", "resolve-home");
        let repo = write_temp_config("", "resolve-repo");
        let missing_home = PathBuf::from("/tmp/shoptrace-definitely-missing-home.toml");

        std::env::set_var(env_key, "/tmp/from-env.toml");
        let from_cli = resolve_config_path_with_overrides(
            Some(PathBuf::from("/tmp/cli.toml")),
            &[env_key],
            Some(home.clone()),
            repo.clone(),
        );
        let from_env =
            resolve_config_path_with_overrides(None, &[env_key], Some(home.clone()), repo.clone());
        std::env::remove_var(env_key);

        let from_home =
            resolve_config_path_with_overrides(None, &[env_key], Some(home.clone()), repo.clone());
        let from_repo =
            resolve_config_path_with_overrides(None, &[env_key], Some(missing_home), repo.clone());

        std::fs::remove_file(&home).ok();
        std::fs::remove_file(&repo).ok();
        assert_eq!(from_cli, PathBuf::from("/tmp/cli.toml"));
        assert_eq!(from_env, PathBuf::from("/tmp/from-env.toml"));
        assert_eq!(from_home, home);
        assert_eq!(from_repo, repo);
    }

    #[test]
    fn shipped_sample_config_matches_defaults() {
        let sample = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/shoptrace.toml");
        let cfg = load_config(sample).expect("sample config should parse");
        let defaults = load_config_or_default("/tmp/shoptrace-no-such-config.toml")
            .expect("defaults when missing");

        assert_eq!(cfg.store.path, defaults.store.path);
        assert_eq!(cfg.store.busy_timeout_ms, defaults.store.busy_timeout_ms);
        assert_eq!(cfg.ingest.anonymous_sessions, defaults.ingest.anonymous_sessions);
        assert_eq!(cfg.ingest.max_session_workers, defaults.ingest.max_session_workers);
        assert_eq!(cfg.ingest.default_page_size, defaults.ingest.default_page_size);
        assert_eq!(cfg.ingest.max_page_size, defaults.ingest.max_page_size);
    }

    #[test]
    fn defaults_match_documented_page_bounds() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.ingest.default_page_size, 50);
        assert_eq!(cfg.ingest.max_page_size, 200);
        assert_eq!(cfg.ingest.anonymous_sessions, AnonymousSessionPolicy::Shared);
    }

    #[test]
    fn load_config_reads_sections_and_clamps_page_size() {
        let path = write_temp_config(
            r#"
[store]
path = "/var/lib/shoptrace/events.db"

[ingest]
anonymous_sessions = "per_event"
max_session_workers = 0
default_page_size = 500
max_page_size = 100
"#,
            "sections",
        );
        let cfg = load_config(&path).expect("config should parse");
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.store.path, "/var/lib/shoptrace/events.db");
        assert_eq!(cfg.ingest.anonymous_sessions, AnonymousSessionPolicy::PerEvent);
        assert_eq!(cfg.ingest.max_session_workers, 1);
        assert_eq!(cfg.ingest.default_page_size, 100);
    }

    #[test]
    fn load_config_errors_when_path_missing() {
        let path = std::env::temp_dir().join("shoptrace-missing-config-does-not-exist.toml");
        let err = load_config(&path).expect_err("missing config path should fail");
        assert!(
            err.to_string().contains("failed to read config"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn load_config_or_default_falls_back_to_expanded_defaults() {
        let path = std::env::temp_dir().join("shoptrace-missing-config-fallback.toml");
        let cfg = load_config_or_default(&path).expect("defaults when missing");
        assert_eq!(cfg.ingest.max_session_workers, 8);
        assert_eq!(cfg.store.busy_timeout_ms, 5_000);
        assert_eq!(cfg.store.path, expand_path("~/.shoptrace/shoptrace.db"));
        assert!(cfg.store.path.ends_with(".shoptrace/shoptrace.db"));
    }

    #[test]
    fn load_config_or_default_still_rejects_a_broken_file() {
        let path = write_temp_config("[ingest]\nmax_page_size = \"lots\"\n", "broken");
        let err = load_config_or_default(&path).expect_err("present but invalid config");
        std::fs::remove_file(&path).ok();
        assert!(
            format!("{err:#}").contains("failed to parse TOML config"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn load_config_errors_on_unknown_top_level_section() {
        let path = write_temp_config(
            r#"
[store]
path = "/tmp/shoptrace.db"

[unexpected]
enabled = true
"#,
            "unknown-top-level",
        );
        let err = load_config(&path).expect_err("unknown top-level section should fail");
        std::fs::remove_file(&path).ok();
        assert!(
            format!("{err:#}").contains("unknown field `unexpected`"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn load_config_errors_on_unknown_anonymous_policy() {
        let path = write_temp_config(
            r#"
[ingest]
anonymous_sessions = "sometimes"
"#,
            "unknown-policy",
        );
        let err = load_config(&path).expect_err("unknown policy should fail");
        std::fs::remove_file(&path).ok();
        assert!(
            format!("{err:#}").contains("unknown variant `sometimes`"),
            "unexpected error: {err:#}"
        );
    }
}
