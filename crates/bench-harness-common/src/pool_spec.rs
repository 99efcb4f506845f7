//! Declarative machine pool specification
//!
//! A pool file is a YAML mapping from a logical machine name to its
//! definition. Entries keep their file order, which is the order machines are
//! handed out by the pool.
//!
//! ```yaml
//! local-box: localhost            # scalar: local machine
//! bench-1:                        # mapping: remote machine over SSH
//!   hostname: 10.0.0.12
//!   username: bench
//!   key_path: ~/.ssh/bench.pem
//! vm-1:                           # mapping with instance_name: cloud VM
//!   project: my-project
//!   zone: us-west1-b
//!   instance_name: bench-vm-1
//!   username: bench
//! ```

use crate::defaults::{
    default_image_family, default_image_project, default_machine_type, default_ssh_port,
};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Pool specification errors
#[derive(Debug, Error)]
pub enum PoolSpecError {
    /// Failed to read the pool file
    #[error("Failed to read pool file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML
    #[error("Failed to parse pool file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The top-level document is not a mapping
    #[error("pool file must be a mapping of machine name to definition")]
    NotAMapping,

    /// A machine name is not a string or number
    #[error("machine names must be scalars, got: {0:?}")]
    InvalidName(Value),

    /// An entry could not be decoded as a remote or cloud definition
    #[error("invalid definition for machine '{name}': {source}")]
    InvalidEntry {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// An entry is a sequence or tagged value
    #[error("unsupported definition for machine '{0}'")]
    UnsupportedEntry(String),
}

impl PoolSpecError {
    /// Create an IO error with path context
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Connection parameters for a statically reachable remote machine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteEntry {
    /// Host name or address to connect to
    pub hostname: String,
    /// Login user
    pub username: String,
    /// Private key used for authentication
    pub key_path: PathBuf,
    /// Passphrase for the private key, if it has one
    #[serde(default)]
    pub key_password: Option<String>,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

/// Parameters for a cloud instance created when the pool is built
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloudEntry {
    pub project: String,
    pub zone: String,
    pub instance_name: String,
    /// Login user; also granted docker access on the instance
    pub username: String,
    /// Private key path; `~/.ssh/<instance_name>.PEM` when unset
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_image_project")]
    pub image_project: String,
    #[serde(default = "default_image_family")]
    pub image_family: String,
    /// Script run by the instance on first boot
    #[serde(default)]
    pub startup_script: Option<PathBuf>,
}

impl CloudEntry {
    /// Private key used to reach the instance once it is up.
    pub fn resolved_key_path(&self) -> PathBuf {
        match &self.key_path {
            Some(path) => expand_home(path),
            None => {
                let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
                home.join(".ssh").join(format!("{}.PEM", self.instance_name))
            }
        }
    }
}

/// How a single pool entry becomes a machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineSpec {
    /// The machine the harness itself runs on
    Local,
    /// A host reachable over SSH
    Remote(RemoteEntry),
    /// A VM provisioned before the pool is used, then reached over SSH
    Cloud(CloudEntry),
}

/// Ordered list of named machine definitions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSpec {
    entries: Vec<(String, MachineSpec)>,
}

impl PoolSpec {
    /// Load a pool specification from a YAML file
    pub fn load(path: &Path) -> Result<Self, PoolSpecError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolSpecError::io(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    /// Parse a pool specification from YAML text
    pub fn parse(content: &str) -> Result<Self, PoolSpecError> {
        let document: Value = serde_yaml::from_str(content)?;
        let mapping = match document {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(mapping) => mapping,
            _ => return Err(PoolSpecError::NotAMapping),
        };
        Self::from_mapping(mapping)
    }

    fn from_mapping(mapping: Mapping) -> Result<Self, PoolSpecError> {
        let mut entries = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let name = match key {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                other => return Err(PoolSpecError::InvalidName(other)),
            };
            let spec = parse_entry(&name, value)?;
            entries.push((name, spec));
        }
        Ok(Self { entries })
    }

    /// Build a specification from already-decoded entries
    pub fn from_entries(entries: Vec<(String, MachineSpec)>) -> Self {
        Self { entries }
    }

    /// Keep only the first `limit` entries
    pub fn truncate(mut self, limit: usize) -> Self {
        self.entries.truncate(limit);
        self
    }

    pub fn entries(&self) -> &[(String, MachineSpec)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for PoolSpec {
    type Item = (String, MachineSpec);
    type IntoIter = std::vec::IntoIter<(String, MachineSpec)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

fn parse_entry(name: &str, value: Value) -> Result<MachineSpec, PoolSpecError> {
    let invalid = |source| PoolSpecError::InvalidEntry {
        name: name.to_string(),
        source,
    };

    let is_cloud = matches!(&value, Value::Mapping(m) if m.contains_key("instance_name"));

    match value {
        Value::Mapping(_) if is_cloud => {
            serde_yaml::from_value(value).map(MachineSpec::Cloud).map_err(invalid)
        }
        Value::Mapping(_) => {
            let mut remote: RemoteEntry = serde_yaml::from_value(value).map_err(invalid)?;
            remote.key_path = expand_home(&remote.key_path);
            Ok(MachineSpec::Remote(remote))
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => Ok(MachineSpec::Local),
        Value::Sequence(_) | Value::Tagged(_) => Err(PoolSpecError::UnsupportedEntry(name.to_string())),
    }
}

/// Expand a leading `~/` to `$HOME`.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MIXED: &str = r#"
zeta: localhost
alpha:
  hostname: 10.0.0.12
  username: bench
  key_path: /keys/bench.pem
vm:
  project: proj
  zone: us-west1-b
  instance_name: bench-vm
  username: bench
"#;

    #[test]
    fn entries_keep_file_order() {
        let spec = PoolSpec::parse(MIXED).unwrap();
        let names: Vec<_> = spec.entries().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "vm"]);
    }

    #[test]
    fn entry_kinds_are_classified() {
        let spec = PoolSpec::parse(MIXED).unwrap();
        assert_eq!(spec.entries()[0].1, MachineSpec::Local);

        match &spec.entries()[1].1 {
            MachineSpec::Remote(remote) => {
                assert_eq!(remote.hostname, "10.0.0.12");
                assert_eq!(remote.port, 22);
                assert_eq!(remote.key_path, PathBuf::from("/keys/bench.pem"));
                assert!(remote.key_password.is_none());
            }
            other => panic!("expected remote entry, got {other:?}"),
        }

        match &spec.entries()[2].1 {
            MachineSpec::Cloud(cloud) => {
                assert_eq!(cloud.instance_name, "bench-vm");
                assert_eq!(cloud.machine_type, "n1-standard-1");
                assert_eq!(cloud.image_family, "debian-9");
            }
            other => panic!("expected cloud entry, got {other:?}"),
        }
    }

    #[test]
    fn remote_without_hostname_is_rejected() {
        let err = PoolSpec::parse("box:\n  username: bench\n  key_path: /k\n").unwrap_err();
        assert!(matches!(err, PoolSpecError::InvalidEntry { ref name, .. } if name == "box"));
    }

    #[test]
    fn sequence_entry_is_rejected() {
        let err = PoolSpec::parse("box: [1, 2]\n").unwrap_err();
        assert!(matches!(err, PoolSpecError::UnsupportedEntry(_)));
    }

    #[test]
    fn top_level_must_be_mapping() {
        assert!(matches!(
            PoolSpec::parse("- a\n- b\n").unwrap_err(),
            PoolSpecError::NotAMapping
        ));
        assert!(PoolSpec::parse("").unwrap().is_empty());
    }

    #[test]
    fn truncate_limits_entries() {
        let spec = PoolSpec::parse(MIXED).unwrap().truncate(2);
        assert_eq!(spec.len(), 2);
    }

    #[test]
    fn cloud_key_defaults_to_instance_pem() {
        let spec = PoolSpec::parse(MIXED).unwrap();
        let MachineSpec::Cloud(cloud) = &spec.entries()[2].1 else {
            panic!("expected cloud entry");
        };
        let path = cloud.resolved_key_path();
        assert!(path.ends_with(".ssh/bench-vm.PEM"), "got {}", path.display());
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{MIXED}").unwrap();
        let spec = PoolSpec::load(file.path()).unwrap();
        assert_eq!(spec.len(), 3);
    }

    #[test]
    fn load_missing_file_names_path() {
        let err = PoolSpec::load(Path::new("/nonexistent/pool.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pool.yaml"));
    }
}
