//! Host service CIDR detection.
//!
//! The virtual cluster must allocate ClusterIPs from the host's service
//! CIDR, or projected Services would carry addresses the host rejects. The
//! range is not directly readable, so it is probed: creating a Service
//! with a deliberately invalid ClusterIP makes the host API server name
//! the valid range in its rejection message. The result is persisted to
//! the control-plane config on first boot.

use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{info, warn};

use crate::error::Error;

/// ConfigMap persisting the detected CIDR across restarts
const CIDR_CONFIGMAP: &str = "vc-service-cidr";
const CIDR_KEY: &str = "cidr";

/// A ClusterIP no sane cluster allocates; the rejection names the range
const PROBE_IP: &str = "4.4.4.4";

/// Fallback when the rejection message cannot be parsed
const DEFAULT_CIDR: &str = "10.96.0.0/12";

/// Detect the host service CIDR, reusing a previously persisted result.
pub async fn ensure_service_cidr(client: Client, namespace: &str) -> Result<String, Error> {
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);

    if let Ok(existing) = config_maps.get(CIDR_CONFIGMAP).await {
        if let Some(cidr) = existing.data.as_ref().and_then(|data| data.get(CIDR_KEY)) {
            info!(cidr = %cidr, "service CIDR loaded from config");
            return Ok(cidr.clone());
        }
    }

    let cidr = detect_service_cidr(client, namespace).await?;

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(CIDR_CONFIGMAP.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some([(CIDR_KEY.to_string(), cidr.clone())].into_iter().collect()),
        ..Default::default()
    };
    match config_maps.create(&PostParams::default(), &config_map).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => warn!(error = %e, "failed to persist service CIDR"),
    }

    Ok(cidr)
}

/// Probe the host for its service CIDR.
pub async fn detect_service_cidr(client: Client, namespace: &str) -> Result<String, Error> {
    let services: Api<Service> = Api::namespaced(client, namespace);

    let probe = Service {
        metadata: ObjectMeta {
            name: Some("vc-cidr-probe".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(PROBE_IP.to_string()),
            ports: Some(vec![k8s_openapi::api::core::v1::ServicePort {
                port: 443,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    match services.create(&PostParams::default(), &probe).await {
        Ok(created) => {
            // unexpectedly valid; clean up and fall back to the assigned
            // address's default range
            let _ = services.delete("vc-cidr-probe", &Default::default()).await;
            let assigned = created
                .spec
                .and_then(|spec| spec.cluster_ip)
                .unwrap_or_else(|| PROBE_IP.to_string());
            warn!(ip = %assigned, "CIDR probe was accepted, falling back to default range");
            Ok(DEFAULT_CIDR.to_string())
        }
        Err(kube::Error::Api(ae)) if ae.code == 422 => {
            let cidr = parse_cidr_from_rejection(&ae.message).unwrap_or_else(|| {
                warn!(message = %ae.message, "could not parse CIDR from rejection");
                DEFAULT_CIDR.to_string()
            });
            info!(cidr = %cidr, "service CIDR detected");
            Ok(cidr)
        }
        Err(e) => Err(e.into()),
    }
}

/// Extract the CIDR from a message like
/// `provided IP is not in the valid range. The range of valid IPs is 10.96.0.0/12`.
fn parse_cidr_from_rejection(message: &str) -> Option<String> {
    let marker = "The range of valid IPs is ";
    let start = message.find(marker)? + marker.len();
    let rest = &message[start..];
    let cidr: String = rest
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == '.' || *c == ':' || *c == '/')
        .collect();
    let cidr = cidr.trim_end_matches('.');
    if cidr.contains('/') {
        Some(cidr.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_range_from_rejection() {
        let message = "Service \"vc-cidr-probe\" is invalid: spec.clusterIPs: Invalid value: \
                       [\"4.4.4.4\"]: failed to allocate IP 4.4.4.4: provided IP is not in the \
                       valid range. The range of valid IPs is 10.96.0.0/12";
        assert_eq!(
            parse_cidr_from_rejection(message),
            Some("10.96.0.0/12".to_string())
        );
    }

    #[test]
    fn parses_ipv6_range_from_rejection() {
        let message = "provided IP is not in the valid range. The range of valid IPs is fd00::/108";
        assert_eq!(parse_cidr_from_rejection(message), Some("fd00::/108".to_string()));
    }

    #[test]
    fn rejects_messages_without_a_range() {
        assert_eq!(parse_cidr_from_rejection("something else went wrong"), None);
        assert_eq!(
            parse_cidr_from_rejection("The range of valid IPs is garbage"),
            None
        );
    }
}
