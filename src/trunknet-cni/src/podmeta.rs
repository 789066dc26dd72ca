//! Pod metadata collaborator
//!
//! The orchestrator only hands the plugin a pod name and namespace;
//! which allocation group the pod draws from, and the addresses it
//! declares affinity for, live in pod annotations. This module reads
//! them through the apiserver using the kubelet's own kubeconfig.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::error::CniError;

/// Annotation carrying the comma-separated candidate address list
pub const ANNOTATION_IP_LIST: &str = "ipv4list";

/// Annotation naming the allocation group
pub const ANNOTATION_GROUP: &str = "ipgroupname";

/// Network placement a pod declares through its annotations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodNetworkSpec {
    /// Declared candidate addresses, in annotation order
    pub candidates: Vec<String>,
    /// Allocation group whose pool serves this pod
    pub group: String,
}

/// Fetch a pod's network placement from its annotations
///
/// A pod without both annotations cannot be placed; that is a hard
/// failure for the invocation, not a default.
pub fn fetch(kubeconfig: &Path, namespace: &str, pod_name: &str) -> Result<PodNetworkSpec, CniError> {
    let rt = Runtime::new().map_err(|e| {
        CniError::io_error("failed to create tokio runtime").with_details(&e.to_string())
    })?;

    rt.block_on(async {
        let kc = Kubeconfig::read_from(kubeconfig).map_err(|e| {
            CniError::io_error(&format!("failed to read kubeconfig {}", kubeconfig.display()))
                .with_details(&e.to_string())
        })?;

        let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                CniError::io_error("failed to build kube client config")
                    .with_details(&e.to_string())
            })?;

        let client = Client::try_from(config).map_err(|e| {
            CniError::io_error("failed to build kube client").with_details(&e.to_string())
        })?;

        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let pod = pods.get(pod_name).await.map_err(|e| {
            CniError::io_error(&format!("failed to fetch pod {}/{}", namespace, pod_name))
                .with_details(&e.to_string())
        })?;

        let spec = annotations_to_spec(namespace, pod_name, pod.metadata.annotations.as_ref())?;
        debug!(
            pod = %format!("{}/{}", namespace, pod_name),
            group = %spec.group,
            candidates = spec.candidates.len(),
            "resolved pod network placement"
        );
        Ok(spec)
    })
}

fn missing_annotation(namespace: &str, pod_name: &str, key: &str) -> CniError {
    CniError::config_error(&format!(
        "pod {}/{} is missing annotation {}",
        namespace, pod_name, key
    ))
}

fn annotations_to_spec(
    namespace: &str,
    pod_name: &str,
    annotations: Option<&BTreeMap<String, String>>,
) -> Result<PodNetworkSpec, CniError> {
    let annotations =
        annotations.ok_or_else(|| missing_annotation(namespace, pod_name, ANNOTATION_GROUP))?;

    let group = annotations
        .get(ANNOTATION_GROUP)
        .map(|g| g.trim().to_string())
        .ok_or_else(|| missing_annotation(namespace, pod_name, ANNOTATION_GROUP))?;
    if group.is_empty() {
        return Err(CniError::config_error(&format!(
            "pod {}/{} has an empty {} annotation",
            namespace, pod_name, ANNOTATION_GROUP
        )));
    }

    let candidates = annotations
        .get(ANNOTATION_IP_LIST)
        .ok_or_else(|| missing_annotation(namespace, pod_name, ANNOTATION_IP_LIST))?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    Ok(PodNetworkSpec { candidates, group })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CniErrorCode;

    fn annotations(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_spec_from_annotations() {
        let ann = annotations(&[
            (ANNOTATION_GROUP, "g1"),
            (ANNOTATION_IP_LIST, "10.0.4.5/23, 10.0.4.6/23"),
        ]);

        let spec = annotations_to_spec("default", "web-0", Some(&ann)).unwrap();
        assert_eq!(spec.group, "g1");
        assert_eq!(spec.candidates, vec!["10.0.4.5/23", "10.0.4.6/23"]);
    }

    #[test]
    fn test_missing_group_annotation() {
        let ann = annotations(&[(ANNOTATION_IP_LIST, "10.0.4.5/23")]);
        let err = annotations_to_spec("default", "web-0", Some(&ann)).unwrap_err();
        assert_eq!(err.code(), CniErrorCode::InvalidNetworkConfig);
    }

    #[test]
    fn test_missing_list_annotation() {
        let ann = annotations(&[(ANNOTATION_GROUP, "g1")]);
        let err = annotations_to_spec("default", "web-0", Some(&ann)).unwrap_err();
        assert_eq!(err.code(), CniErrorCode::InvalidNetworkConfig);
    }

    #[test]
    fn test_no_annotations_at_all() {
        assert!(annotations_to_spec("default", "web-0", None).is_err());
    }

    #[test]
    fn test_empty_group_rejected() {
        let ann = annotations(&[(ANNOTATION_GROUP, "  "), (ANNOTATION_IP_LIST, "10.0.4.5/23")]);
        assert!(annotations_to_spec("default", "web-0", Some(&ann)).is_err());
    }

    #[test]
    fn test_empty_list_tolerated() {
        let ann = annotations(&[(ANNOTATION_GROUP, "g1"), (ANNOTATION_IP_LIST, "")]);
        let spec = annotations_to_spec("default", "web-0", Some(&ann)).unwrap();
        assert!(spec.candidates.is_empty());
    }
}
