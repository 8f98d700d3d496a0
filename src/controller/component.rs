//! Component identities and the rolling-update dependency graph.
//!
//! Every component statically declares which components must adopt a new
//! image before it does (upgrade dependencies). Downgrade ordering is the
//! inverse: a component may regress only once everything depending on it has
//! regressed. The graph is a data table so adding a component is a data
//! change, not a control-flow change.

use crate::controller::error::{Error, Result};
use crate::crd::{ClusterMode, DatabaseCluster};

/// Fixed enumerable set of cluster components.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Component {
    Proxy,
    MixCoord,
    DataNode,
    QueryNode,
    IndexNode,
    StreamingNode,
    Standalone,
}

/// Upgrade dependencies per component: a component adopts a new image only
/// once every listed component already runs it with a ready rollout.
///
/// Leaves (no dependencies) update first on upgrade and last on downgrade.
pub const COMPONENT_DEPENDENCIES: &[(Component, &[Component])] = &[
    (Component::IndexNode, &[]),
    (Component::StreamingNode, &[Component::IndexNode]),
    (Component::MixCoord, &[Component::StreamingNode]),
    (Component::DataNode, &[Component::MixCoord]),
    (Component::QueryNode, &[Component::MixCoord]),
    (Component::Proxy, &[Component::MixCoord]),
    (Component::Standalone, &[]),
];

impl Component {
    pub const ALL: &'static [Component] = &[
        Component::Proxy,
        Component::MixCoord,
        Component::DataNode,
        Component::QueryNode,
        Component::IndexNode,
        Component::StreamingNode,
        Component::Standalone,
    ];

    /// Stable name, used in labels, deploy-status keys, and workload names.
    pub fn name(self) -> &'static str {
        match self {
            Component::Proxy => "proxy",
            Component::MixCoord => "mixcoord",
            Component::DataNode => "datanode",
            Component::QueryNode => "querynode",
            Component::IndexNode => "indexnode",
            Component::StreamingNode => "streamingnode",
            Component::Standalone => "standalone",
        }
    }

    /// Components that must run the new image before this one upgrades.
    pub fn upgrade_dependencies(self) -> &'static [Component] {
        COMPONENT_DEPENDENCIES
            .iter()
            .find(|(c, _)| *c == self)
            .map(|(_, deps)| *deps)
            .unwrap_or(&[])
    }

    /// Components that must regress before this one downgrades, derived by
    /// reversing the upgrade edges.
    pub fn downgrade_dependents(self) -> Vec<Component> {
        COMPONENT_DEPENDENCIES
            .iter()
            .filter(|(_, deps)| deps.contains(&self))
            .map(|(c, _)| *c)
            .collect()
    }

    /// Whether this component hosts the embedded message queue and needs the
    /// data volume when embedded-queue persistence is enabled.
    pub fn hosts_embedded_queue(self) -> bool {
        matches!(self, Component::Standalone | Component::StreamingNode)
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Components deployed for the cluster's mode.
pub fn enabled_components(cluster: &DatabaseCluster) -> &'static [Component] {
    match cluster.spec.mode {
        ClusterMode::Standalone => &[Component::Standalone],
        ClusterMode::Cluster => &[
            Component::IndexNode,
            Component::StreamingNode,
            Component::MixCoord,
            Component::DataNode,
            Component::QueryNode,
            Component::Proxy,
        ],
    }
}

/// Verify the dependency table is acyclic. Runs every reconcile so a bad
/// table edit fails closed instead of wedging a rolling update.
pub fn verify_acyclic() -> Result<()> {
    for (component, _) in COMPONENT_DEPENDENCIES {
        let mut stack = vec![*component];
        let mut visited = Vec::new();
        while let Some(current) = stack.pop() {
            for dep in current.upgrade_dependencies() {
                if *dep == *component {
                    return Err(Error::Validation(format!(
                        "component dependency cycle through {}",
                        component
                    )));
                }
                if !visited.contains(dep) {
                    visited.push(*dep);
                    stack.push(*dep);
                }
            }
        }
    }
    Ok(())
}
