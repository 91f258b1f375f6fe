//! Canonical path layout under the SpinDB root
//!
//! Every path the core touches is computed here and nowhere else. The
//! layout guarantees that no two containers share a data/log/pid/socket
//! path and no two installations share a bin path.
//!
//! ```text
//! ~/.spindb/
//!   config.json
//!   containers/{name}.json
//!   bin/{engine}-{version}-{os}-{arch}/bin/...
//!   data/{engine}/{name}/
//!   logs/{engine}/{name}.log
//!   run/{engine}/{name}.pid
//!   run/{engine}/{name}.sock
//!   registry/{engine}.json
//!   tmp/
//! ```

use std::path::{Path, PathBuf};

use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::domain::version::{Version, sort_versions_desc};
use crate::infrastructure::platform::{ArchTag, OsTag};

/// Path authority for one SpinDB root directory
#[derive(Debug, Clone)]
pub struct SpinPaths {
    root: PathBuf,
}

impl SpinPaths {
    /// Paths rooted at an explicit directory (tests use a temp dir)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root: `~/.spindb`
    pub fn default_root() -> SpinResult<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            SpinError::precondition("Home directory not found (HOME/USERPROFILE unset)")
        })?;
        Ok(Self::new(home.join(".spindb")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    pub fn container_file(&self, name: &str) -> PathBuf {
        self.containers_dir().join(format!("{name}.json"))
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// Install directory for one (engine, version, os, arch) tuple
    pub fn install_dir(&self, engine: Engine, version: &str, os: OsTag, arch: ArchTag) -> PathBuf {
        self.bin_dir().join(format!(
            "{}-{}-{}-{}",
            engine.tag(),
            version,
            os.as_str(),
            arch.as_str()
        ))
    }

    pub fn data_dir(&self, engine: Engine, name: &str) -> PathBuf {
        self.root.join("data").join(engine.tag()).join(name)
    }

    pub fn log_file(&self, engine: Engine, name: &str) -> PathBuf {
        self.root.join("logs").join(engine.tag()).join(format!("{name}.log"))
    }

    pub fn pid_file(&self, engine: Engine, name: &str) -> PathBuf {
        self.root.join("run").join(engine.tag()).join(format!("{name}.pid"))
    }

    pub fn socket_file(&self, engine: Engine, name: &str) -> PathBuf {
        self.root.join("run").join(engine.tag()).join(format!("{name}.sock"))
    }

    pub fn registry_file(&self, engine: Engine) -> PathBuf {
        self.root.join("registry").join(format!("{}.json", engine.tag()))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Per-install scratch directory, removed when the install finishes
    pub fn install_tmp_dir(&self, engine: Engine, version: &str) -> PathBuf {
        self.tmp_dir().join(format!("install-{}-{}", engine.tag(), version))
    }

    /// Scan `bin/` for installed versions of an engine on this platform,
    /// returning full version strings sorted latest-first
    pub fn installed_versions(&self, engine: Engine, os: OsTag, arch: ArchTag) -> Vec<String> {
        let suffix = format!("-{}-{}", os.as_str(), arch.as_str());
        let prefix = format!("{}-", engine.tag());
        let mut versions = Vec::new();
        let Ok(entries) = std::fs::read_dir(self.bin_dir()) else {
            return versions;
        };
        for entry in entries.flatten() {
            let Ok(file_name) = entry.file_name().into_string() else { continue };
            if let Some(rest) = file_name.strip_prefix(&prefix) {
                if let Some(version) = rest.strip_suffix(&suffix) {
                    if Version::parse(version).is_ok() {
                        versions.push(version.to_string());
                    }
                }
            }
        }
        sort_versions_desc(&mut versions);
        versions
    }

    /// Highest installed version matching a major, or `None`
    pub fn find_installed_binary_for_major(
        &self,
        engine: Engine,
        major: u32,
        os: OsTag,
        arch: ArchTag,
    ) -> Option<PathBuf> {
        self.installed_versions(engine, os, arch)
            .into_iter()
            .find(|v| Version::parse(v).map(|p| p.major == major).unwrap_or(false))
            .map(|v| self.install_dir(engine, &v, os, arch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> SpinPaths {
        SpinPaths::new("/srv/spindb")
    }

    #[test]
    fn test_layout_is_disjoint_per_container() {
        let p = paths();
        assert_ne!(
            p.data_dir(Engine::Postgresql, "a"),
            p.data_dir(Engine::Postgresql, "b")
        );
        assert_ne!(
            p.data_dir(Engine::Postgresql, "a"),
            p.data_dir(Engine::Mysql, "a")
        );
        assert_ne!(p.pid_file(Engine::Redis, "a"), p.log_file(Engine::Redis, "a"));
    }

    #[test]
    fn test_install_dir_shape() {
        let p = paths();
        let dir = p.install_dir(Engine::Postgresql, "16.4.0", OsTag::Linux, ArchTag::X64);
        assert!(dir.ends_with("bin/postgresql-16.4.0-linux-x64"));
    }

    #[test]
    fn test_find_installed_binary_for_major() {
        let tmp = tempfile::tempdir().unwrap();
        let p = SpinPaths::new(tmp.path());
        for v in ["16.2.0", "16.4.0", "15.8.0"] {
            std::fs::create_dir_all(p.install_dir(Engine::Postgresql, v, OsTag::Linux, ArchTag::X64))
                .unwrap();
        }
        // Foreign platform entry must not match
        std::fs::create_dir_all(p.install_dir(Engine::Postgresql, "16.9.0", OsTag::Darwin, ArchTag::Arm64))
            .unwrap();

        let found = p
            .find_installed_binary_for_major(Engine::Postgresql, 16, OsTag::Linux, ArchTag::X64)
            .unwrap();
        assert!(found.ends_with("postgresql-16.4.0-linux-x64"));
        assert!(p.find_installed_binary_for_major(Engine::Postgresql, 14, OsTag::Linux, ArchTag::X64).is_none());
    }
}
