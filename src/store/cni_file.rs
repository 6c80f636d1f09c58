use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::types::CniConfig;

#[derive(Debug, thiserror::Error)]
pub enum CniError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode CNI config: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sink for generated CNI configurations.
pub trait CniStore: Send + Sync {
    fn set(&self, config: &CniConfig) -> Result<(), CniError>;
}

/// Writes CNI configurations as `<dir>/<network>.conf`, atomically: the
/// payload goes to a temp file in the same directory, is fsynced, then
/// renamed over the target so the container runtime never observes a partial
/// file.
pub struct CniFileStore {
    dir: PathBuf,
}

impl CniFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> CniFileStore {
        CniFileStore { dir: dir.into() }
    }
}

impl CniStore for CniFileStore {
    fn set(&self, config: &CniConfig) -> Result<(), CniError> {
        fs::create_dir_all(&self.dir)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o755))?;

        let data = serde_json::to_vec_pretty(config)?;

        // The temp file must live in the target directory: rename is only
        // atomic within a filesystem.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&data)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        let target = self.dir.join(format!("{}.conf", config.name));
        let file = tmp.persist(&target).map_err(|e| e.error)?;
        file.set_permissions(fs::Permissions::from_mode(0o644))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::cni::CniIpv4Config;

    fn test_config(mtu: u32) -> CniConfig {
        CniConfig {
            name: "v".to_string(),
            bridge: Some("vbrd0".to_string()),
            mtu,
            ipmasq: false,
            ipv4: CniIpv4Config {
                network: "10.10.0.0/16".to_string(),
                subnet: "10.10.5.1/24".to_string(),
                gateway: Some("10.10.5.1".to_string()),
            },
        }
    }

    #[test]
    fn set_writes_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = CniFileStore::new(dir.path().join("cni"));

        store.set(&test_config(1450)).unwrap();

        let path = dir.path().join("cni").join("v.conf");
        let raw = fs::read_to_string(&path).unwrap();
        let decoded: CniConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded, test_config(1450));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn set_overwrites_existing_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = CniFileStore::new(dir.path());

        store.set(&test_config(1450)).unwrap();
        store.set(&test_config(8950)).unwrap();

        let raw = fs::read_to_string(dir.path().join("v.conf")).unwrap();
        let decoded: CniConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.mtu, 8950);
    }

    #[test]
    fn set_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = CniFileStore::new(&nested);

        store.set(&test_config(1450)).unwrap();
        assert!(nested.join("v.conf").exists());
    }
}
