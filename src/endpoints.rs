//! Publishing the master address as the Service's Endpoints.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use std::net::IpAddr;
use tracing::debug;

use crate::error::{is_status, PublishError};
use crate::service::{LogicalService, MANAGER};

/// Makes the routing target point at an address.
///
/// Must be idempotent: publishing the address already in place leaves
/// observable state unchanged, and a missing target is created.
#[async_trait]
pub trait TargetPublisher: Send + Sync {
    /// Point `service` at `addr`.
    async fn publish(&self, service: &LogicalService, addr: IpAddr) -> Result<(), PublishError>;
}

/// Writes a selector-less Service's Endpoints object.
#[derive(Clone)]
pub struct EndpointsPublisher {
    client: Client,
}

impl EndpointsPublisher {
    /// Create a publisher using the given Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetPublisher for EndpointsPublisher {
    async fn publish(&self, service: &LogicalService, addr: IpAddr) -> Result<(), PublishError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &service.namespace);
        let endpoints = build_endpoints(service, addr);
        let pp = PostParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        };

        // Unconditional replace: we are the only intended writer and the
        // whole object is derived from `addr`.
        match api.replace(&service.name, &pp, &endpoints).await {
            Ok(_) => return Ok(()),
            Err(e) if is_status(&e, 404) => {
                debug!(endpoints = %service.name, "Endpoints not found, creating");
            }
            Err(e) => return Err(e.into()),
        }

        match api.create(&pp, &endpoints).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => {
                // Created concurrently between our replace and create.
                debug!(endpoints = %service.name, "Endpoints created concurrently, replacing");
                api.replace(&service.name, &pp, &endpoints).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Endpoints with one subset: the master address on the service port.
pub fn build_endpoints(service: &LogicalService, addr: IpAddr) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(service.name.clone()),
            namespace: Some(service.namespace.clone()),
            labels: Some(service.labels()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: addr.to_string(),
                ..Default::default()
            }]),
            ports: Some(vec![EndpointPort {
                name: Some(service.port_name.clone()),
                port: i32::from(service.port_number),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}
