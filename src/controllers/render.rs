//! Rendering of a [`DesiredConfig`] into workload files, and the restart
//! classification of a change between two configs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::controllers::resolver::DesiredConfig;
use crate::settings::OperatorSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    ServerProperties,
    ClientProperties,
    ZookeeperJaas,
    Environment,
    Keystore,
    Truststore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedFile {
    pub kind: FileKind,
    pub path: PathBuf,
    pub contents: String,
}

/// What a configuration change demands of the running broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestartNeed {
    None,
    /// Plain service restart
    Restart,
    /// Disable and re-enable the service so it picks up new mounts
    StorageRestart,
}

pub fn properties_text(props: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in props {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Files implied by `desired`, in a fixed order.
pub fn render(desired: &DesiredConfig, settings: &OperatorSettings) -> Vec<RenderedFile> {
    let mut files = vec![
        RenderedFile {
            kind: FileKind::ServerProperties,
            path: settings.server_properties_path(),
            contents: properties_text(&desired.server_properties),
        },
        RenderedFile {
            kind: FileKind::ClientProperties,
            path: settings.client_properties_path(),
            contents: properties_text(&desired.client_properties),
        },
        RenderedFile {
            kind: FileKind::ZookeeperJaas,
            path: settings.jaas_path(),
            contents: desired.jaas.clone(),
        },
        RenderedFile {
            kind: FileKind::Environment,
            path: settings.environment_path(),
            contents: format!("KAFKA_OPTS=\"{}\"\n", desired.kafka_opts),
        },
    ];

    if let Some(tls) = &desired.tls {
        let mut keystore = tls.certificate.trim_end().to_string();
        keystore.push('\n');
        keystore.push_str(tls.private_key.trim_end());
        keystore.push('\n');

        let mut truststore = tls.ca.trim_end().to_string();
        truststore.push('\n');
        if let Some(chain) = &tls.chain {
            truststore.push_str(chain.trim_end());
            truststore.push('\n');
        }

        files.push(RenderedFile {
            kind: FileKind::Keystore,
            path: tls.keystore_path.clone(),
            contents: keystore,
        });
        files.push(RenderedFile {
            kind: FileKind::Truststore,
            path: tls.truststore_path.clone(),
            contents: truststore,
        });
    }
    files
}

/// Classify the change from `old` to `new`. A unit that has never applied
/// a config needs no restart; its first start picks everything up.
pub fn restart_need(old: Option<&DesiredConfig>, new: &DesiredConfig) -> RestartNeed {
    let old = match old {
        Some(old) => old,
        None => return RestartNeed::None,
    };

    let without_dirs = |c: &DesiredConfig| {
        let mut props = c.server_properties.clone();
        props.remove("log.dirs");
        props
    };

    if without_dirs(old) != without_dirs(new)
        || old.jaas != new.jaas
        || old.kafka_opts != new.kafka_opts
        || old.tls != new.tls
    {
        RestartNeed::Restart
    } else if old.log_dirs != new.log_dirs {
        RestartNeed::StorageRestart
    } else {
        RestartNeed::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_properties_text_sorted() {
        let mut props = BTreeMap::new();
        props.insert("b".to_string(), "2".to_string());
        props.insert("a".to_string(), "1".to_string());
        assert_eq!(properties_text(&props), "a=1\nb=2\n");
    }

    #[test]
    fn test_render_plaintext_files() {
        let settings = OperatorSettings::default();
        let desired = fixtures::desired_config(false);
        let files = render(&desired, &settings);
        let kinds: Vec<FileKind> = files.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FileKind::ServerProperties,
                FileKind::ClientProperties,
                FileKind::ZookeeperJaas,
                FileKind::Environment
            ]
        );
        let jaas_flag =
            "-Djava.security.auth.login.config=/var/snap/charmed-kafka/common/zookeeper-jaas.cfg";
        assert!(files[3].contents.contains(jaas_flag));
    }

    #[test]
    fn test_render_tls_files() {
        let settings = OperatorSettings::default();
        let desired = fixtures::desired_config(true);
        let files = render(&desired, &settings);
        assert_eq!(files.len(), 6);
        let keystore = files.iter().find(|f| f.kind == FileKind::Keystore).unwrap();
        assert!(keystore.contents.contains("BEGIN CERTIFICATE"));
        assert!(keystore.contents.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_restart_classification() {
        let base = fixtures::desired_config(false);
        assert_eq!(restart_need(None, &base), RestartNeed::None);
        assert_eq!(restart_need(Some(&base), &base), RestartNeed::None);

        let mut client_only = base.clone();
        client_only
            .client_properties
            .insert("bootstrap.servers".into(), "10.9.9.9:9092".into());
        assert_eq!(restart_need(Some(&base), &client_only), RestartNeed::None);

        let mut dirs = base.clone();
        dirs.log_dirs.push(PathBuf::from("/data/log-data-1"));
        dirs.server_properties
            .insert("log.dirs".into(), "/data/log-data-0,/data/log-data-1".into());
        assert_eq!(restart_need(Some(&base), &dirs), RestartNeed::StorageRestart);

        let tls = fixtures::desired_config(true);
        assert_eq!(restart_need(Some(&base), &tls), RestartNeed::Restart);
    }
}
