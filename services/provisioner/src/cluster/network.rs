//! Addresses derived from the declared service and pod ranges.

use std::net::Ipv4Addr;

use fleetkube_networking::{cluster_dns_ip, kubernetes_service_ip, Ipv4Prefix};

use super::{ClusterSpec, ConfigError};

/// Network parameters every component builder needs, resolved once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterNetwork {
    pub service_range: Ipv4Prefix,
    pub cluster_cidr: Ipv4Prefix,
    /// First host address of the service range (`kubernetes.default`).
    pub kubernetes_service_ip: Ipv4Addr,
    pub dns_ip: Ipv4Addr,
}

impl ClusterNetwork {
    pub fn from_spec(spec: &ClusterSpec) -> Result<Self, ConfigError> {
        let api = &spec.services.kube_api;
        let controller = &spec.services.kube_controller;

        let service_range = Ipv4Prefix::from_cidr(&api.service_cluster_ip_range).map_err(|e| {
            ConfigError::InvalidService {
                service: "kube-api",
                reason: e.to_string(),
            }
        })?;
        let controller_range = Ipv4Prefix::from_cidr(&controller.service_cluster_ip_range)
            .map_err(|e| ConfigError::InvalidService {
                service: "kube-controller",
                reason: e.to_string(),
            })?;
        if controller_range != service_range {
            return Err(ConfigError::InvalidService {
                service: "kube-controller",
                reason: format!(
                    "service_cluster_ip_range {} differs from kube-api's {}",
                    controller_range, service_range
                ),
            });
        }

        let cluster_cidr = Ipv4Prefix::from_cidr(&controller.cluster_cidr).map_err(|e| {
            ConfigError::InvalidService {
                service: "kube-controller",
                reason: e.to_string(),
            }
        })?;
        if cluster_cidr.overlaps(&service_range) {
            return Err(ConfigError::InvalidService {
                service: "kube-controller",
                reason: format!(
                    "cluster_cidr {} overlaps the service range {}",
                    cluster_cidr, service_range
                ),
            });
        }

        let too_small = |e: fleetkube_networking::NetworkError| ConfigError::InvalidService {
            service: "kube-api",
            reason: e.to_string(),
        };
        Ok(Self {
            service_range,
            cluster_cidr,
            kubernetes_service_ip: kubernetes_service_ip(&service_range).map_err(too_small)?,
            dns_ip: cluster_dns_ip(&service_range).map_err(too_small)?,
        })
    }
}
