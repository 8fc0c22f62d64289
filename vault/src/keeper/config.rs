//! Declarative per-application configuration.
//!
//! One `config.yaml` per application under the keeper root describes the
//! components, their remote-state directives, shared directive groups and
//! discovery settings. Config errors are fatal at startup.

use crate::state::RemoteStateDirective;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_COMMS_PORT: u16 = 8888;
pub const DEFAULT_NODE_DIRECTORY: &str = "https://api.runonflux.io";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("malformed yaml in `{path}`: {message}")]
    MalformedYaml { path: PathBuf, message: String },

    #[error("remote workdir must be absolute in component `{component}`: `{path}`")]
    NonAbsoluteRemoteWorkdir { component: String, path: PathBuf },

    #[error("local path must be relative in directive `{directive}` of component `{component}`")]
    AbsoluteLocalPath {
        component: String,
        directive: String,
    },

    #[error("component `{component}` references unknown group `{group}`")]
    UnknownGroup { component: String, group: String },

    #[error("component `{component}` lists unknown task `{task}`")]
    UnknownTask { component: String, task: String },

    #[error("could not read `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_comms_port() -> u16 {
    DEFAULT_COMMS_PORT
}

fn default_polling_interval() -> Duration {
    Duration::from_secs(900)
}

fn default_node_directory() -> String {
    DEFAULT_NODE_DIRECTORY.to_string()
}

/// Directives shared by several components.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct GroupConfig {
    #[serde(default)]
    pub directives: Vec<RemoteStateDirective>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ComponentConfig {
    /// Absolute working directory on the agent.
    pub remote_workdir: PathBuf,
    #[serde(default)]
    pub directives: Vec<RemoteStateDirective>,
    /// Shared groups whose directives this component inherits.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Task pipeline override; empty means the default pipeline.
    #[serde(default)]
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    pub app_name: String,

    #[serde(default = "default_comms_port")]
    pub comms_port: u16,

    #[serde(
        default = "default_polling_interval",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub polling_interval: Duration,

    /// Explicit agent addresses. Empty means "discover through the node
    /// directory".
    #[serde(default)]
    pub agents: Vec<String>,

    /// Fabric address whose key signs authenticated connections.
    #[serde(default)]
    pub signing_identity: Option<String>,

    #[serde(default = "default_node_directory")]
    pub node_directory: String,

    /// Optional per-call timeout for data RPCs; handshake steps have
    /// their own fixed timeout.
    #[serde(
        default,
        deserialize_with = "duration_str::deserialize_option_duration"
    )]
    pub rpc_timeout: Option<Duration>,

    #[serde(default)]
    pub run_once: bool,

    /// Keep the transport open between tasks of one cycle.
    #[serde(default)]
    pub stay_connected: bool,

    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,

    pub components: HashMap<String, ComponentConfig>,

    /// Directives merged into every component, sourced from the
    /// application's common files.
    #[serde(default)]
    pub common: Vec<RemoteStateDirective>,
}

impl ApplicationConfig {
    pub fn load(path: &Path) -> Result<ApplicationConfig, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ApplicationConfig =
            serde_yaml::from_str(&raw).map_err(|err| ConfigError::MalformedYaml {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, component) in &self.components {
            if !component.remote_workdir.is_absolute() {
                return Err(ConfigError::NonAbsoluteRemoteWorkdir {
                    component: name.clone(),
                    path: component.remote_workdir.clone(),
                });
            }

            for group in &component.groups {
                if !self.groups.contains_key(group) {
                    return Err(ConfigError::UnknownGroup {
                        component: name.clone(),
                        group: group.clone(),
                    });
                }
            }

            for task in &component.tasks {
                if super::tasks::KeeperTaskKind::parse(task).is_none() {
                    return Err(ConfigError::UnknownTask {
                        component: name.clone(),
                        task: task.clone(),
                    });
                }
            }

            for directive in self.resolved_directives(name) {
                if directive.local_relative().is_absolute() {
                    return Err(ConfigError::AbsoluteLocalPath {
                        component: name.clone(),
                        directive: directive.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// All directives of a component: its own, its groups', and the
    /// application-wide common set.
    pub fn resolved_directives(&self, component: &str) -> Vec<RemoteStateDirective> {
        let Some(spec) = self.components.get(component) else {
            return Vec::new();
        };

        let mut directives = spec.directives.clone();
        for group in &spec.groups {
            if let Some(group_config) = self.groups.get(group) {
                directives.extend(group_config.directives.iter().cloned());
            }
        }
        directives.extend(self.common.iter().cloned());
        directives
    }
}

/// On-disk layout of the keeper root.
#[derive(Debug, Clone)]
pub struct KeeperPaths {
    root: PathBuf,
}

impl KeeperPaths {
    pub fn new(root: &Path) -> Self {
        KeeperPaths {
            root: root.to_path_buf(),
        }
    }

    /// OS data directory per the host convention.
    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fabric-vault")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.root.join("ca")
    }

    pub fn app_dir(&self, app: &str) -> PathBuf {
        self.root.join(app)
    }

    pub fn app_config(&self, app: &str) -> PathBuf {
        self.app_dir(app).join("config.yaml")
    }

    pub fn component_staging(&self, app: &str, component: &str) -> PathBuf {
        self.app_dir(app)
            .join("components")
            .join(component)
            .join("staging")
    }

    pub fn common_files(&self, app: &str) -> PathBuf {
        self.app_dir(app).join("common_files")
    }

    /// Applications are the root directories holding a `config.yaml`.
    pub fn discover_apps(&self) -> std::io::Result<Vec<String>> {
        let mut apps = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().join("config.yaml").is_file() {
                apps.push(name);
            }
        }
        apps.sort();
        Ok(apps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
app_name: demoapp
comms_port: 8888
polling_interval: 15m
agents: ["10.0.0.7"]
groups:
  shared:
    directives:
      - name: ca-bundle.pem
        strategy: ENSURE_CREATED
components:
  web:
    remote_workdir: /app
    groups: [shared]
    directives:
      - name: quotes.txt
        strategy: STRICT
      - name: assets
        remote_dir: /srv/static
        strategy: ALLOW_ADDS
common:
  - name: motd.txt
"#;

    #[test]
    fn test_sample_config_parses_and_validates() {
        let config: ApplicationConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.app_name, "demoapp");
        assert_eq!(config.polling_interval, Duration::from_secs(900));
        assert_eq!(config.agents, vec!["10.0.0.7"]);

        let directives = config.resolved_directives("web");
        let names: Vec<&str> = directives.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["quotes.txt", "assets", "ca-bundle.pem", "motd.txt"]
        );
    }

    #[test]
    fn test_relative_remote_workdir_is_fatal() {
        let yaml = r#"
app_name: demoapp
components:
  web:
    remote_workdir: relative/path
"#;
        let config: ApplicationConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonAbsoluteRemoteWorkdir { .. })
        ));
    }

    #[test]
    fn test_absolute_local_path_is_fatal() {
        let yaml = r#"
app_name: demoapp
components:
  web:
    remote_workdir: /app
    directives:
      - name: leak
        local_path: /etc/passwd
"#;
        let config: ApplicationConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AbsoluteLocalPath { .. })
        ));
    }

    #[test]
    fn test_unknown_group_is_fatal() {
        let yaml = r#"
app_name: demoapp
components:
  web:
    remote_workdir: /app
    groups: [nope]
"#;
        let config: ApplicationConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownGroup { .. })
        ));
    }

    #[test]
    fn test_paths_layout() {
        let paths = KeeperPaths::new(Path::new("/var/lib/vault"));
        assert_eq!(paths.ca_dir(), PathBuf::from("/var/lib/vault/ca"));
        assert_eq!(
            paths.component_staging("demoapp", "web"),
            PathBuf::from("/var/lib/vault/demoapp/components/web/staging")
        );
        assert_eq!(
            paths.common_files("demoapp"),
            PathBuf::from("/var/lib/vault/demoapp/common_files")
        );
    }
}
