//! Farm configuration parsing.

use crate::{ConfigError, ConfigResult};
use buildfarm_core::BuildStatus;
use buildfarm_core::ImageType;
use buildfarm_core::secret::Credentials;
use buildfarm_core::worker::WorkerInfo;
use kdl::{KdlDocument, KdlNode};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Statuses that trigger a notification when none are configured.
pub const DEFAULT_NOTIFY_ON: [BuildStatus; 2] = [BuildStatus::FailedToBuild, BuildStatus::ChrootWait];

const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Farm-wide configuration.
#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// Farm name, used in logs.
    pub name: String,
    /// Root holding the `grabbing` and `incoming` directories.
    pub root: PathBuf,
    /// Directory for stored build logs.
    pub content_store: PathBuf,
    /// Base URL used to build `build_url` arguments.
    pub public_url: Option<String>,
    /// Statuses that trigger a notification.
    pub notify_on: Vec<BuildStatus>,
    /// How often the manager polls busy workers.
    pub poll_interval: Duration,
    pub workers: Vec<WorkerConfig>,
    pub images: Vec<ImageConfig>,
    pub archive_auth: Vec<ArchiveAuthConfig>,
}

impl FarmConfig {
    pub fn grabbing_dir(&self) -> PathBuf {
        self.root.join("grabbing")
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join("incoming")
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub name: String,
    pub url: String,
    pub virtualized: bool,
}

impl From<&WorkerConfig> for WorkerInfo {
    fn from(config: &WorkerConfig) -> Self {
        WorkerInfo {
            name: config.name.clone(),
            url: config.url.clone(),
            virtualized: config.virtualized,
        }
    }
}

/// A registered base image for one series/architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub series: String,
    pub arch: String,
    pub image_type: ImageType,
    pub url: String,
    pub sha256: String,
}

/// Credentials workers use to fetch from a private archive.
#[derive(Debug, Clone)]
pub struct ArchiveAuthConfig {
    pub archive_id: i64,
    pub credentials: Credentials,
}

/// Read and parse a farm configuration file.
pub fn load_farm_config(path: impl AsRef<Path>) -> ConfigResult<FarmConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_farm_config(&content)
}

/// Parse a farm configuration from KDL text.
pub fn parse_farm_config(kdl: &str) -> ConfigResult<FarmConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut root = None;
    let mut content_store = None;
    let mut public_url = None;
    let mut notify_on = None;
    let mut poll_interval = Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS);
    let mut workers: Vec<WorkerConfig> = Vec::new();
    let mut images: Vec<ImageConfig> = Vec::new();
    let mut archive_auth: Vec<ArchiveAuthConfig> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "farm" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("farm name".to_string()))?;
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "root" => root = get_first_string_arg(child).map(PathBuf::from),
                            "content-store" => {
                                content_store = get_first_string_arg(child).map(PathBuf::from)
                            }
                            "public-url" => public_url = get_first_string_arg(child),
                            "notify-on" => notify_on = Some(parse_notify_on(child)?),
                            "poll-interval-secs" => {
                                let secs = get_first_int_arg(child)
                                    .filter(|secs| *secs > 0)
                                    .ok_or_else(|| ConfigError::InvalidValue {
                                        field: "poll-interval-secs".to_string(),
                                        message: "expected a positive integer".to_string(),
                                    })?;
                                poll_interval = Duration::from_secs(secs as u64);
                            }
                            _ => {}
                        }
                    }
                }
            }
            "worker" => {
                let worker = parse_worker(node)?;
                if workers.iter().any(|w| w.name == worker.name) {
                    return Err(ConfigError::Duplicate(format!("worker '{}'", worker.name)));
                }
                workers.push(worker);
            }
            "image" => {
                let image = parse_image(node)?;
                if images.iter().any(|i| {
                    i.series == image.series
                        && i.arch == image.arch
                        && i.image_type == image.image_type
                }) {
                    return Err(ConfigError::Duplicate(format!(
                        "{} image for {}/{}",
                        image.image_type, image.series, image.arch
                    )));
                }
                images.push(image);
            }
            "archive-auth" => {
                let auth = parse_archive_auth(node)?;
                if archive_auth.iter().any(|a| a.archive_id == auth.archive_id) {
                    return Err(ConfigError::Duplicate(format!(
                        "credentials for archive {}",
                        auth.archive_id
                    )));
                }
                archive_auth.push(auth);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("farm name".to_string()));
    }
    let root = root.ok_or_else(|| ConfigError::MissingField("farm root".to_string()))?;
    let content_store = content_store.unwrap_or_else(|| root.join("content"));

    Ok(FarmConfig {
        name,
        root,
        content_store,
        public_url,
        notify_on: notify_on.unwrap_or_else(|| DEFAULT_NOTIFY_ON.to_vec()),
        poll_interval,
        workers,
        images,
        archive_auth,
    })
}

fn parse_notify_on(node: &KdlNode) -> ConfigResult<Vec<BuildStatus>> {
    let mut seen = HashSet::new();
    let mut statuses = Vec::new();
    for token in get_all_string_args(node) {
        let status: BuildStatus = token.parse().map_err(|message| ConfigError::InvalidValue {
            field: "notify-on".to_string(),
            message,
        })?;
        if !status.is_terminal() {
            return Err(ConfigError::InvalidValue {
                field: "notify-on".to_string(),
                message: format!("{} is not a terminal status", status),
            });
        }
        if seen.insert(status) {
            statuses.push(status);
        }
    }
    Ok(statuses)
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("worker name".to_string()))?;
    let url = get_string_prop(node, "url")
        .ok_or_else(|| ConfigError::MissingField(format!("url for worker '{}'", name)))?;
    let virtualized = get_bool_prop(node, "virtualized").unwrap_or(false);

    Ok(WorkerConfig {
        name,
        url,
        virtualized,
    })
}

fn parse_image(node: &KdlNode) -> ConfigResult<ImageConfig> {
    let series = get_string_prop(node, "series")
        .ok_or_else(|| ConfigError::MissingField("image series".to_string()))?;
    let arch = get_string_prop(node, "arch")
        .ok_or_else(|| ConfigError::MissingField("image arch".to_string()))?;
    let type_name = get_string_prop(node, "type")
        .ok_or_else(|| ConfigError::MissingField("image type".to_string()))?;
    let image_type: ImageType = type_name.parse().map_err(|message| ConfigError::InvalidValue {
        field: "image type".to_string(),
        message,
    })?;
    let url = get_string_prop(node, "url")
        .ok_or_else(|| ConfigError::MissingField(format!("url for {}/{} image", series, arch)))?;
    let sha256 = get_string_prop(node, "sha256")
        .ok_or_else(|| ConfigError::MissingField(format!("sha256 for {}/{} image", series, arch)))?;
    if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidValue {
            field: "image sha256".to_string(),
            message: format!("'{}' is not a hex SHA-256 digest", sha256),
        });
    }

    Ok(ImageConfig {
        series,
        arch,
        image_type,
        url,
        sha256: sha256.to_lowercase(),
    })
}

fn parse_archive_auth(node: &KdlNode) -> ConfigResult<ArchiveAuthConfig> {
    let archive_id = get_first_int_arg(node)
        .ok_or_else(|| ConfigError::MissingField("archive-auth archive id".to_string()))?;
    let username = get_string_prop(node, "username").ok_or_else(|| {
        ConfigError::MissingField(format!("username for archive {}", archive_id))
    })?;
    let password = get_string_prop(node, "password").ok_or_else(|| {
        ConfigError::MissingField(format!("password for archive {}", archive_id))
    })?;

    Ok(ArchiveAuthConfig {
        archive_id,
        credentials: Credentials::new(username, password),
    })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i64> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .and_then(|i| i64::try_from(i).ok())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn full_config() -> String {
        format!(
            r#"
            farm "ppa-farm" {{
                root "/srv/buildfarm"
                public-url "https://builds.example.net"
                notify-on "FAILEDTOBUILD" "MANUALDEPWAIT"
                poll-interval-secs 5
            }}

            worker "bob" url="http://bob.example.net:8221" virtualized=#true
            worker "alice" url="http://alice.example.net:8221"

            image series="noble" arch="amd64" type="chroot" url="https://files.example.net/chroot.tar.gz" sha256="{SHA}"
            image series="noble" arch="amd64" type="lxd" url="https://files.example.net/lxd.tar.gz" sha256="{SHA}"

            archive-auth 42 username="buildd" password="s3cret"
        "#
        )
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_farm_config(&full_config()).unwrap();
        assert_eq!(config.name, "ppa-farm");
        assert_eq!(config.root, PathBuf::from("/srv/buildfarm"));
        assert_eq!(config.content_store, PathBuf::from("/srv/buildfarm/content"));
        assert_eq!(config.incoming_dir(), PathBuf::from("/srv/buildfarm/incoming"));
        assert_eq!(
            config.notify_on,
            vec![BuildStatus::FailedToBuild, BuildStatus::ManualDepWait]
        );
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.workers.len(), 2);
        assert!(config.worker("bob").unwrap().virtualized);
        assert!(!config.worker("alice").unwrap().virtualized);
        assert_eq!(config.images.len(), 2);
        assert_eq!(config.images[1].image_type, ImageType::Lxd);
        assert_eq!(config.archive_auth[0].archive_id, 42);
        assert_eq!(config.archive_auth[0].credentials.password.expose(), "s3cret");
    }

    #[test]
    fn test_defaults() {
        let config = parse_farm_config(
            r#"
            farm "minimal" {
                root "/tmp/farm"
            }
        "#,
        )
        .unwrap();
        assert_eq!(config.notify_on, DEFAULT_NOTIFY_ON.to_vec());
        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert!(config.workers.is_empty());
        assert!(config.public_url.is_none());
    }

    #[test]
    fn test_missing_root() {
        let result = parse_farm_config(r#"farm "no-root""#);
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_unknown_notify_status() {
        let result = parse_farm_config(
            r#"
            farm "bad" {
                root "/tmp/farm"
                notify-on "EXPLODED"
            }
        "#,
        );
        assert!(matches!(result.unwrap_err(), ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_non_terminal_notify_status() {
        let result = parse_farm_config(
            r#"
            farm "bad" {
                root "/tmp/farm"
                notify-on "BUILDING"
            }
        "#,
        );
        assert!(matches!(result.unwrap_err(), ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_unknown_image_type() {
        let kdl = format!(
            r#"
            farm "bad" {{
                root "/tmp/farm"
            }}
            image series="noble" arch="amd64" type="vm" url="https://x" sha256="{SHA}"
        "#
        );
        let result = parse_farm_config(&kdl);
        assert!(matches!(result.unwrap_err(), ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_duplicate_worker() {
        let result = parse_farm_config(
            r#"
            farm "dup" {
                root "/tmp/farm"
            }
            worker "bob" url="http://a"
            worker "bob" url="http://b"
        "#,
        );
        assert!(matches!(result.unwrap_err(), ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_duplicate_image() {
        let kdl = format!(
            r#"
            farm "dup" {{
                root "/tmp/farm"
            }}
            image series="noble" arch="amd64" type="chroot" url="https://a" sha256="{SHA}"
            image series="noble" arch="amd64" type="chroot" url="https://b" sha256="{SHA}"
        "#
        );
        let result = parse_farm_config(&kdl);
        assert!(matches!(result.unwrap_err(), ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_bad_digest() {
        let result = parse_farm_config(
            r#"
            farm "bad" {
                root "/tmp/farm"
            }
            image series="noble" arch="amd64" type="chroot" url="https://a" sha256="nothex"
        "#,
        );
        assert!(matches!(result.unwrap_err(), ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("farm.kdl");
        std::fs::write(&path, full_config()).unwrap();
        let config = load_farm_config(&path).unwrap();
        assert_eq!(config.name, "ppa-farm");

        let missing = load_farm_config(dir.path().join("missing.kdl"));
        assert!(matches!(missing.unwrap_err(), ConfigError::Io(_)));
    }
}
