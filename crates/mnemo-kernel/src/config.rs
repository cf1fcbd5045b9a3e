//! Configuration loading from `~/.mnemo/config.toml` with defaults.
//!
//! The `include` field lists additional TOML files that are deep-merged
//! beneath the root file (root overrides includes). `MNEMO_DATA_DIR` and
//! `MNEMO_LOG_LEVEL` override whatever the files say.

use mnemo_types::config::MemoryConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

pub const ENV_DATA_DIR: &str = "MNEMO_DATA_DIR";
pub const ENV_LOG_LEVEL: &str = "MNEMO_LOG_LEVEL";

/// Load configuration, falling back to defaults on any read, parse, or
/// validation error. Environment overrides are applied last.
pub fn load_config(path: Option<&Path>) -> MemoryConfig {
    let mut config = load_file(path);
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

fn load_file(path: Option<&Path>) -> MemoryConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return MemoryConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to read config file, using defaults");
            return MemoryConfig::default();
        }
    };
    let mut root_value = match toml::from_str::<toml::Value>(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to parse config, using defaults");
            return MemoryConfig::default();
        }
    };

    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));
    if let Err(e) = resolve_config_includes(&mut root_value, &config_dir, &mut visited, 0) {
        warn!(error = %e, "Config include resolution failed, using root config only");
    }
    if let toml::Value::Table(ref mut tbl) = root_value {
        tbl.remove("include");
    }

    match root_value.try_into::<MemoryConfig>() {
        Ok(config) => match config.validate() {
            Ok(()) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(error = %e, path = %config_path.display(), "Invalid config, using defaults");
                MemoryConfig::default()
            }
        },
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to deserialize merged config, using defaults");
            MemoryConfig::default()
        }
    }
}

/// Apply environment overrides read through `lookup`.
pub fn apply_overrides<F>(config: &mut MemoryConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
        info!(data_dir = %dir, "Data directory overridden from environment");
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
        config.log_level = level;
    }
}

/// Deep-merge included files beneath `root_value`.
///
/// Rejects absolute paths, `..` components, paths escaping the config
/// directory, and circular references.
fn resolve_config_includes(
    root_value: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "Config include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"
        ));
    }

    let includes: Vec<String> = match root_value {
        toml::Value::Table(tbl) => match tbl.get("include") {
            Some(toml::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => return Ok(()),
        },
        _ => return Ok(()),
    };
    if includes.is_empty() {
        return Ok(());
    }

    let canonical_dir = std::fs::canonicalize(config_dir)
        .map_err(|e| format!("Config dir cannot be canonicalized: {e}"))?;
    let mut merged = toml::Value::Table(toml::map::Map::new());

    for name in &includes {
        let include_path = Path::new(name);
        if include_path.is_absolute() {
            return Err(format!("Config include rejects absolute path: {name}"));
        }
        if include_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("Config include rejects path traversal: {name}"));
        }

        let canonical = std::fs::canonicalize(config_dir.join(include_path))
            .map_err(|e| format!("Config include '{name}' cannot be resolved: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(format!("Config include '{name}' escapes config directory"));
        }
        if !visited.insert(canonical.clone()) {
            return Err(format!("Circular config include detected: {name}"));
        }

        info!(include = %name, "Loading config include");
        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("Failed to read config include '{name}': {e}"))?;
        let mut value: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config include '{name}': {e}"))?;

        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_config_includes(&mut value, &include_dir, visited, depth + 1)?;
        if let toml::Value::Table(ref mut tbl) = value {
            tbl.remove("include");
        }
        deep_merge_toml(&mut merged, &value);
    }

    let mut root = root_value.clone();
    if let toml::Value::Table(ref mut tbl) = root {
        tbl.remove("include");
    }
    deep_merge_toml(&mut merged, &root);
    *root_value = merged;
    Ok(())
}

/// Deep-merge two TOML values; tables merge recursively, otherwise `overlay` wins.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// `~/.mnemo`, or a temp directory when there is no home.
pub fn mnemo_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".mnemo")
}

pub fn default_config_path() -> PathBuf {
    mnemo_home().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(path: &Path, lines: &[&str]) {
        let mut f = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_file(Some(Path::new("/nonexistent/mnemo.toml")));
        assert_eq!(config, MemoryConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write(
            &path,
            &[
                "log_level = \"debug\"",
                "[routing]",
                "slot_count = 5",
                "[search]",
                "cache_ttl_secs = 0",
            ],
        );
        let config = load_file(Some(&path));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.routing.slot_count, 5);
        assert_eq!(config.routing.existing_branch_threshold, 0.7);
        assert_eq!(config.search.cache_ttl_secs, 0);
        assert_eq!(config.ledger.checkpoint_interval, 100);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write(
            &path,
            &["[routing]", "divergence_threshold = 0.9", "existing_branch_threshold = 0.5"],
        );
        assert_eq!(load_file(Some(&path)), MemoryConfig::default());
    }

    #[test]
    fn test_deep_merge_nested_tables() {
        let mut base: toml::Value = toml::from_str(
            r#"
            [consolidation]
            candidates = 4
            max_attempts = 5
        "#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
            [consolidation]
            candidates = 12
        "#,
        )
        .unwrap();
        deep_merge_toml(&mut base, &overlay);
        let c = base["consolidation"].as_table().unwrap();
        assert_eq!(c["candidates"].as_integer(), Some(12));
        assert_eq!(c["max_attempts"].as_integer(), Some(5));
    }

    #[test]
    fn test_include_merged_beneath_root() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("tuning.toml"),
            &["log_level = \"trace\"", "[search]", "default_k = 9"],
        );
        let root = dir.path().join("config.toml");
        write(&root, &["include = [\"tuning.toml\"]", "log_level = \"warn\""]);

        let config = load_file(Some(&root));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.search.default_k, 9);
    }

    #[test]
    fn test_rejected_includes_use_root_only() {
        let dir = tempfile::tempdir().unwrap();
        for include in ["../outside.toml", "/etc/mnemo.toml"] {
            let root = dir.path().join("config.toml");
            write(
                &root,
                &[&format!("include = [\"{include}\"]"), "log_level = \"debug\""],
            );
            let config = load_file(Some(&root));
            assert_eq!(config.log_level, "debug", "{include}");
        }
    }

    #[test]
    fn test_circular_include_does_not_hang() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.toml"), &["include = [\"b.toml\"]", "log_level = \"info\""]);
        write(&dir.path().join("b.toml"), &["include = [\"a.toml\"]"]);
        let config = load_file(Some(&dir.path().join("a.toml")));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MemoryConfig::default();
        apply_overrides(&mut config, |key| match key {
            ENV_DATA_DIR => Some("/var/lib/mnemo".to_string()),
            ENV_LOG_LEVEL => Some("debug".to_string()),
            _ => None,
        });
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/mnemo"));
        assert_eq!(config.log_level, "debug");

        let mut untouched = MemoryConfig::default();
        apply_overrides(&mut untouched, |_| Some("  ".to_string()));
        assert_eq!(untouched, MemoryConfig::default());
    }
}
