//! The headless Service clients address, and its one-time creation.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::{is_status, FailoverError, PublishError};

/// Field manager / label value for objects this controller writes.
pub const MANAGER: &str = "sentinel-failover";

/// Identity of the Service clients connect to. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalService {
    /// Service and Endpoints name.
    pub name: String,
    /// Namespace of both objects.
    pub namespace: String,
    /// Name of the single TCP port.
    pub port_name: String,
    /// Port number of the master.
    pub port_number: u16,
}

impl LogicalService {
    /// Build the service identity from configuration, resolving the namespace.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, FailoverError> {
        Ok(Self {
            name: config.name.clone(),
            namespace: config.resolve_namespace()?,
            port_name: config.port_name.clone(),
            port_number: config.port_number,
        })
    }

    /// Labels put on every object we create.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "app.kubernetes.io/managed-by".to_string(),
                MANAGER.to_string(),
            ),
            ("app.kubernetes.io/name".to_string(), self.name.clone()),
        ])
    }

    /// Headless Service without a selector, so its Endpoints are ours to manage.
    pub fn to_service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some(self.port_name.clone()),
                    port: i32::from(self.port_number),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Create the Service if it does not exist. An existing Service is left
/// untouched, whoever created it.
pub async fn ensure_service(client: Client, service: &LogicalService) -> Result<(), PublishError> {
    let api: Api<Service> = Api::namespaced(client, &service.namespace);
    let pp = PostParams {
        field_manager: Some(MANAGER.to_string()),
        ..Default::default()
    };

    match api.create(&pp, &service.to_service()).await {
        Ok(_) => {
            info!(service = %service.name, namespace = %service.namespace, "Created service");
            Ok(())
        }
        Err(e) if is_status(&e, 409) => {
            info!(service = %service.name, namespace = %service.namespace, "Service already exists");
            Ok(())
        }
        Err(e) => {
            warn!(
                service = %service.name,
                namespace = %service.namespace,
                error = %e,
                "Failed to create service"
            );
            Err(e.into())
        }
    }
}
