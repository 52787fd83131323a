use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    DbLeaf,
    String,
    Aggregator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafHostInfo {
    pub host: String,
    pub port: u16,
    pub role: NodeRole,
}

impl LeafHostInfo {
    pub fn new(host: impl Into<String>, port: u16, role: NodeRole) -> Self {
        Self {
            host: host.into(),
            port,
            role,
        }
    }
}

impl fmt::Display for LeafHostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ClusterConfigError {
    #[error("Failed to read cluster config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed cluster config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// How this server participates in a cluster, chosen by `--cluster` or
/// `--string-servers`. The two flags are mutually exclusive; the check lives
/// in config resolution so no file is read for a bad combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMode {
    Standalone,
    Aggregator { config: PathBuf },
    StringServers { config: PathBuf },
}

impl ClusterMode {
    pub fn is_distributed(&self) -> bool {
        !matches!(self, ClusterMode::Standalone)
    }

    pub fn load_topology(&self) -> Result<ClusterTopology, ClusterConfigError> {
        match self {
            ClusterMode::Standalone => Ok(ClusterTopology::default()),
            ClusterMode::Aggregator { config } => {
                let nodes = load(config)?;
                Ok(ClusterTopology::from_nodes(&nodes))
            }
            ClusterMode::StringServers { config } => {
                let nodes = load(config)?;
                Ok(ClusterTopology {
                    db_leaves: Vec::new(),
                    string_leaves: filter_by_role(&nodes, NodeRole::String),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    pub db_leaves: Vec<LeafHostInfo>,
    pub string_leaves: Vec<LeafHostInfo>,
}

impl ClusterTopology {
    pub fn from_nodes(all: &[LeafHostInfo]) -> Self {
        Self {
            db_leaves: filter_by_role(all, NodeRole::DbLeaf),
            string_leaves: filter_by_role(all, NodeRole::String),
        }
    }
}

/// Reads a JSON array of `{"host", "port", "role"}` peer definitions.
pub fn load(path: &Path) -> Result<Vec<LeafHostInfo>, ClusterConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ClusterConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&raw).map_err(|source| ClusterConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse(raw: &str) -> Result<Vec<LeafHostInfo>, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn filter_by_role(all: &[LeafHostInfo], role: NodeRole) -> Vec<LeafHostInfo> {
    all.iter().filter(|leaf| leaf.role == role).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CLUSTER_JSON: &str = r#"[
        {"host": "leaf1", "port": 16274, "role": "dbleaf"},
        {"host": "strings", "port": 6601, "role": "string"},
        {"host": "leaf2", "port": 16275, "role": "dbleaf"},
        {"host": "agg", "port": 9091, "role": "aggregator"}
    ]"#;

    #[test]
    fn parse_reads_roles() {
        let nodes = parse(CLUSTER_JSON).unwrap();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[1], LeafHostInfo::new("strings", 6601, NodeRole::String));
        assert_eq!(nodes[3].role, NodeRole::Aggregator);
    }

    #[test]
    fn topology_keeps_input_order() {
        let nodes = parse(CLUSTER_JSON).unwrap();
        let topology = ClusterTopology::from_nodes(&nodes);

        let hosts: Vec<_> = topology.db_leaves.iter().map(|l| l.host.as_str()).collect();
        assert_eq!(hosts, vec!["leaf1", "leaf2"]);
        assert_eq!(topology.string_leaves.len(), 1);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let raw = r#"[{"host": "x", "port": 1, "role": "primary"}]"#;
        assert!(parse(raw).is_err());
    }

    #[test]
    fn string_servers_mode_ignores_db_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.conf");
        std::fs::write(&path, CLUSTER_JSON).unwrap();

        let topology = ClusterMode::StringServers { config: path }
            .load_topology()
            .unwrap();
        assert!(topology.db_leaves.is_empty());
        assert_eq!(topology.string_leaves[0].host, "strings");
    }

    #[test]
    fn missing_file_is_io_error() {
        let mode = ClusterMode::Aggregator {
            config: PathBuf::from("/nonexistent/cluster.conf"),
        };
        assert!(matches!(
            mode.load_topology(),
            Err(ClusterConfigError::Io { .. })
        ));
    }

    fn role_strategy() -> impl Strategy<Value = NodeRole> {
        prop_oneof![
            Just(NodeRole::DbLeaf),
            Just(NodeRole::String),
            Just(NodeRole::Aggregator),
        ]
    }

    fn leaf_strategy() -> impl Strategy<Value = LeafHostInfo> {
        ("[a-z]{1,8}", any::<u16>(), role_strategy())
            .prop_map(|(host, port, role)| LeafHostInfo::new(host, port, role))
    }

    proptest! {
        #[test]
        fn filter_by_role_partitions_input(nodes in prop::collection::vec(leaf_strategy(), 0..32)) {
            let topology = ClusterTopology::from_nodes(&nodes);

            prop_assert!(topology.db_leaves.iter().all(|l| l.role == NodeRole::DbLeaf));
            prop_assert!(topology.string_leaves.iter().all(|l| l.role == NodeRole::String));

            let expected_db: Vec<_> = nodes.iter().filter(|l| l.role == NodeRole::DbLeaf).cloned().collect();
            let expected_string: Vec<_> = nodes.iter().filter(|l| l.role == NodeRole::String).cloned().collect();
            prop_assert_eq!(&topology.db_leaves, &expected_db);
            prop_assert_eq!(&topology.string_leaves, &expected_string);
        }

        #[test]
        fn filter_by_role_is_pure(nodes in prop::collection::vec(leaf_strategy(), 0..16)) {
            let before = nodes.clone();
            let first = filter_by_role(&nodes, NodeRole::String);
            let second = filter_by_role(&nodes, NodeRole::String);
            prop_assert_eq!(first, second);
            prop_assert_eq!(nodes, before);
        }
    }
}
