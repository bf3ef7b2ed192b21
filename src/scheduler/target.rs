use crate::error::{FleetError, Result};
use crate::scheduler::job::TargetSpec;
use crate::scheduler::registry::NodeRegistry;

/// Expand a target into the concrete node ids it covers right now.
///
/// The result is sorted and free of duplicates. Membership is read once;
/// nodes that join a group later are not covered.
pub fn resolve_target(target: &TargetSpec, registry: &NodeRegistry) -> Result<Vec<String>> {
    let mut nodes = match target {
        TargetSpec::All => registry.node_ids(),
        TargetSpec::Group(group_id) => registry.group_members(group_id),
        TargetSpec::Node(node_id) => {
            if !registry.contains(node_id) {
                return Err(FleetError::InvalidTarget(format!(
                    "unknown node {}",
                    node_id
                )));
            }
            vec![node_id.clone()]
        }
    };
    nodes.sort();
    nodes.dedup();

    if nodes.is_empty() {
        return Err(FleetError::InvalidTarget(format!(
            "target {} matches no nodes",
            target
        )));
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.upsert_node("web-2", None, vec!["web".into()]);
        registry.upsert_node("web-1", None, vec!["web".into(), "prod".into()]);
        registry.upsert_node("db-1", None, vec!["prod".into()]);
        registry
    }

    #[test]
    fn all_covers_every_node() {
        let nodes = resolve_target(&TargetSpec::All, &registry()).unwrap();
        assert_eq!(nodes, vec!["db-1", "web-1", "web-2"]);
    }

    #[test]
    fn group_covers_members_only() {
        let nodes = resolve_target(&TargetSpec::Group("web".into()), &registry()).unwrap();
        assert_eq!(nodes, vec!["web-1", "web-2"]);
    }

    #[test]
    fn node_must_be_known() {
        let reg = registry();
        assert_eq!(
            resolve_target(&TargetSpec::Node("db-1".into()), &reg).unwrap(),
            vec!["db-1"]
        );
        assert!(matches!(
            resolve_target(&TargetSpec::Node("nope".into()), &reg),
            Err(FleetError::InvalidTarget(_))
        ));
    }

    #[test]
    fn empty_expansion_is_rejected() {
        assert!(resolve_target(&TargetSpec::Group("empty".into()), &registry()).is_err());
        assert!(resolve_target(&TargetSpec::All, &NodeRegistry::new()).is_err());
    }
}
