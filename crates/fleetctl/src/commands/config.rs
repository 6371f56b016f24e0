use std::path::Path;

use anyhow::Context;
use fleetgrid_rollout::EngineConfig;

/// Parse and validate an engine config, then print it in full.
pub fn check(path: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::from_file(path)
        .with_context(|| format!("invalid engine config {}", path.display()))?;
    println!("✓ {} is valid", path.display());
    println!();
    print!("{}", config.to_toml_string()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[queue]\nmax_concurrent_devices = 4\n").unwrap();
        check(&path).unwrap();
    }

    #[test]
    fn rejects_invalid_config_with_path_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[admission]\npage_size = 0\n").unwrap();
        let err = check(&path).unwrap_err();
        assert!(format!("{err:#}").contains("page_size"));
        assert!(err.to_string().contains("engine.toml"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check(&dir.path().join("absent.toml")).is_err());
    }
}
