use crate::controller::Reconciler;
use k8s_openapi::api::core::v1::Node;

/// Label put on nodes running Container Linux
pub const LINUX_CONTAINER_LABEL: &str = "kubermatic.io/uses-container-linux";

pub const LINUX_CONTAINER_VALUE: &str = "true";

/// Substring of `status.nodeInfo.osImage` identifying Container Linux
pub const CONTAINER_LINUX_IMAGE: &str = "Container Linux";

/// Labels every node whose OS image is Container Linux
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerLinuxLabeler;

impl ContainerLinuxLabeler {
    #[must_use]
    pub fn runs_container_linux(node: &Node) -> bool {
        node.status
            .as_ref()
            .and_then(|status| status.node_info.as_ref())
            .is_some_and(|info| info.os_image.contains(CONTAINER_LINUX_IMAGE))
    }

    #[must_use]
    pub fn is_labeled(node: &Node) -> bool {
        node.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LINUX_CONTAINER_LABEL))
            .is_some_and(|value| value == LINUX_CONTAINER_VALUE)
    }
}

impl Reconciler<Node> for ContainerLinuxLabeler {
    fn desired_state(&self, current: &Node) -> Option<Node> {
        if !Self::runs_container_linux(current) || Self::is_labeled(current) {
            return None;
        }

        let mut desired = current.clone();
        desired
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(
                LINUX_CONTAINER_LABEL.to_string(),
                LINUX_CONTAINER_VALUE.to_string(),
            );
        Some(desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeStatus, NodeSystemInfo};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(name: &str, os_image: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    os_image: os_image.to_string(),
                    ..NodeSystemInfo::default()
                }),
                ..NodeStatus::default()
            }),
            ..Node::default()
        }
    }

    #[test]
    fn test_container_linux_node_is_labeled() {
        let labeler = ContainerLinuxLabeler;
        let desired = labeler
            .desired_state(&node("node-1", "Container Linux 2345.3.1"))
            .unwrap();

        assert!(ContainerLinuxLabeler::is_labeled(&desired));
        // applying the rule to its own output changes nothing
        assert!(labeler.desired_state(&desired).is_none());
    }

    #[test]
    fn test_other_images_untouched() {
        let labeler = ContainerLinuxLabeler;
        assert!(labeler.desired_state(&node("node-2", "Ubuntu 20.04")).is_none());
        assert!(labeler.desired_state(&Node::default()).is_none());
    }

    #[test]
    fn test_existing_labels_preserved() {
        let mut current = node("node-1", "Container Linux by CoreOS 2345.3.1");
        current.metadata.labels = Some(BTreeMap::from([(
            "kubernetes.io/hostname".to_string(),
            "node-1".to_string(),
        )]));

        let desired = ContainerLinuxLabeler.desired_state(&current).unwrap();
        let labels = desired.metadata.labels.unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["kubernetes.io/hostname"], "node-1");
        assert_eq!(labels[LINUX_CONTAINER_LABEL], "true");
    }

    #[test]
    fn test_wrong_label_value_is_corrected() {
        let mut current = node("node-1", "Container Linux 2345.3.1");
        current.metadata.labels = Some(BTreeMap::from([(
            LINUX_CONTAINER_LABEL.to_string(),
            "false".to_string(),
        )]));

        let desired = ContainerLinuxLabeler.desired_state(&current).unwrap();
        assert!(ContainerLinuxLabeler::is_labeled(&desired));
    }
}
