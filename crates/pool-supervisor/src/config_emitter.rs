//! Relay Config Emitter (spec §4.B) — writes the per-instance relay config
//! file into a per-instance data directory. Idempotent: safe to call on
//! every `start()`.

use std::path::Path;

use tokio::fs;

use crate::alloc::SlotAllocation;
use crate::PoolError;

/// Write the config file for `alloc`, creating `data_dir` (mode 0700) first
/// if it doesn't already exist. Country/strict-nodes lines are emitted only
/// when `countries` is non-empty (spec §6 "Config file format").
pub async fn emit(
    alloc: &SlotAllocation,
    countries: &[String],
    strict_nodes: bool,
) -> Result<(), PoolError> {
    ensure_data_dir(&alloc.data_dir).await?;

    let mut config = String::new();
    config.push_str(&format!("SocksPort 127.0.0.1:{}\n", alloc.socks_port));
    config.push_str(&format!("ControlPort 127.0.0.1:{}\n", alloc.control_port));
    config.push_str(&format!("DataDirectory {}\n", alloc.data_dir.display()));
    config.push_str("CookieAuthentication 1\n");
    config.push_str("CircuitBuildTimeout 30\n");
    config.push_str("LearnCircuitBuildTimeout 0\n");
    config.push_str("MaxCircuitDirtiness 600\n");
    if !countries.is_empty() {
        let wrapped: Vec<String> = countries.iter().map(|c| format!("{{{c}}}")).collect();
        config.push_str(&format!("ExitNodes {}\n", wrapped.join(",")));
        if strict_nodes {
            config.push_str("StrictNodes 1\n");
        }
    }

    let config_path = config_file_path(&alloc.data_dir);
    fs::write(&config_path, config).await.map_err(|err| {
        PoolError::ConfigInvalid(format!(
            "failed to write config for {}: {err}",
            alloc.node_id
        ))
    })?;

    Ok(())
}

/// The path `start()` passes to the child via `-f <config>`.
pub fn config_file_path(data_dir: &Path) -> std::path::PathBuf {
    data_dir.join("relay.conf")
}

async fn ensure_data_dir(data_dir: &Path) -> Result<(), PoolError> {
    if data_dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(data_dir).await.map_err(|err| {
        PoolError::ConfigInvalid(format!(
            "failed to create data dir {}: {err}",
            data_dir.display()
        ))
    })?;
    set_owner_only_perms(data_dir).await
}

#[cfg(unix)]
async fn set_owner_only_perms(data_dir: &Path) -> Result<(), PoolError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o700);
    fs::set_permissions(data_dir, perms).await.map_err(|err| {
        PoolError::ConfigInvalid(format!(
            "failed to set permissions on {}: {err}",
            data_dir.display()
        ))
    })
}

#[cfg(not(unix))]
async fn set_owner_only_perms(_data_dir: &Path) -> Result<(), PoolError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::allocate;

    #[tokio::test]
    async fn emits_expected_lines_without_countries() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocate(30000, 40000, dir.path().to_str().unwrap(), 0);

        emit(&alloc, &[], false).await.unwrap();

        let contents = fs::read_to_string(config_file_path(&alloc.data_dir))
            .await
            .unwrap();
        assert!(contents.contains("SocksPort 127.0.0.1:30000\n"));
        assert!(contents.contains("ControlPort 127.0.0.1:40000\n"));
        assert!(contents.contains("CookieAuthentication 1\n"));
        assert!(!contents.contains("ExitNodes"));
        assert!(!contents.contains("StrictNodes"));
    }

    #[tokio::test]
    async fn emits_exit_nodes_and_strict_when_countries_set() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocate(30000, 40000, dir.path().to_str().unwrap(), 1);

        emit(&alloc, &["US".to_string(), "DE".to_string()], true)
            .await
            .unwrap();

        let contents = fs::read_to_string(config_file_path(&alloc.data_dir))
            .await
            .unwrap();
        assert!(contents.contains("ExitNodes {US},{DE}\n"));
        assert!(contents.contains("StrictNodes 1\n"));
    }

    #[tokio::test]
    async fn omits_strict_nodes_when_not_strict() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocate(30000, 40000, dir.path().to_str().unwrap(), 0);

        emit(&alloc, &["US".to_string()], false).await.unwrap();

        let contents = fs::read_to_string(config_file_path(&alloc.data_dir))
            .await
            .unwrap();
        assert!(contents.contains("ExitNodes {US}\n"));
        assert!(!contents.contains("StrictNodes"));
    }

    #[tokio::test]
    async fn is_idempotent_across_repeated_emits() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocate(30000, 40000, dir.path().to_str().unwrap(), 0);

        emit(&alloc, &[], false).await.unwrap();
        emit(&alloc, &[], false).await.unwrap();

        let contents = fs::read_to_string(config_file_path(&alloc.data_dir))
            .await
            .unwrap();
        assert_eq!(contents.matches("SocksPort").count(), 1);
    }
}
