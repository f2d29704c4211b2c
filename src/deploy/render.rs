//! Renders a server record into orchestrator objects (spec.md §4.F
//! "Rendered objects").

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, Secret, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta as K8sObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::K8sSettings;
use crate::model::{EnvVar, Manifest, RuntimeConfig, ServerRecord};

use super::psa::{container_security_context, pod_security_context};

pub const OWNER_LABEL: &str = "mcp.obot.ai/server";
pub const REVISION_ANNOTATION: &str = "obot-revision";
pub const K8S_SETTINGS_HASH_ANNOTATION: &str = "obot.ai/k8s-settings-hash";

/// Everything rendered for one server (spec.md §4.F: one env secret, one
/// deployment, one service; files/webhook/runtime-config secrets are
/// optional and omitted here when the manifest carries no uploaded files or
/// webhooks).
pub struct RenderedObjects {
    pub env_secret: Secret,
    pub deployment: Deployment,
    pub service: Service,
}

fn owner_labels(server_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(OWNER_LABEL.to_string(), server_name.to_string())])
}

fn env_secret_string_data(env: &[EnvVar]) -> BTreeMap<String, String> {
    env.iter()
        .filter_map(|e| e.value.clone().map(|v| (e.key.clone(), v)))
        .collect()
}

fn render_env_secret(namespace: &str, server_name: &str, manifest: &Manifest) -> Secret {
    Secret {
        metadata: K8sObjectMeta {
            name: Some(format!("{server_name}-env")),
            namespace: Some(namespace.to_string()),
            labels: Some(owner_labels(server_name)),
            ..Default::default()
        },
        string_data: Some(env_secret_string_data(&manifest.env)),
        ..Default::default()
    }
}

fn main_container(server_name: &str, manifest: &Manifest, settings: &K8sSettings) -> Container {
    let (image, command, args, port) = match &manifest.runtime {
        RuntimeConfig::Uvx { package, command, args } => {
            ("ghcr.io/obot-platform/uvx-runner:latest".to_string(), command.clone(), args.clone(), None)
        }
        RuntimeConfig::Npx { package: _, args } => {
            ("ghcr.io/obot-platform/npx-runner:latest".to_string(), None, args.clone(), None)
        }
        RuntimeConfig::Containerized { image, command, args, port, .. } => {
            (image.clone(), command.clone(), args.clone(), Some(*port))
        }
        RuntimeConfig::Remote(_) | RuntimeConfig::Composite { .. } => {
            // These runtimes are served without a scheduled pod; callers
            // should not reach render() for them.
            (String::new(), None, vec![], None)
        }
    };

    Container {
        name: "mcp".to_string(),
        image: Some(image),
        command: command.map(|c| vec![c]),
        args: if args.is_empty() { None } else { Some(args) },
        ports: port.map(|p| {
            vec![k8s_openapi::api::core::v1::ContainerPort { container_port: p as i32, ..Default::default() }]
        }),
        env_from: Some(vec![k8s_openapi::api::core::v1::EnvFromSource {
            secret_ref: Some(k8s_openapi::api::core::v1::SecretEnvSource {
                name: format!("{server_name}-env"),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        security_context: Some(container_security_context(settings.psa_level)),
        resources: settings.resources.as_ref().map(|r| k8s_openapi::api::core::v1::ResourceRequirements {
            requests: Some(BTreeMap::from_iter(
                [
                    r.cpu.clone().map(|v| ("cpu".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(v))),
                    r.memory.clone().map(|v| ("memory".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(v))),
                ]
                .into_iter()
                .flatten(),
            )),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn render_deployment(
    namespace: &str,
    server: &ServerRecord,
    settings: &K8sSettings,
    revision: &str,
) -> Deployment {
    let name = server.meta.name.clone();
    let labels = owner_labels(&name);

    let mut annotations = BTreeMap::new();
    annotations.insert(REVISION_ANNOTATION.to_string(), revision.to_string());
    annotations.insert(K8S_SETTINGS_HASH_ANNOTATION.to_string(), settings.hash());

    Deployment {
        metadata: K8sObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(K8sObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![main_container(&name, &server.spec.manifest, settings)],
                    affinity: settings.affinity.clone().and_then(|v| serde_json::from_value(v).ok()),
                    tolerations: settings
                        .tolerations
                        .clone()
                        .and_then(|v| serde_json::from_value(v).ok()),
                    runtime_class_name: settings.runtime_class_name.clone(),
                    security_context: Some(pod_security_context(settings.psa_level)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn render_service(namespace: &str, server_name: &str, port: Option<u16>) -> Service {
    let labels = owner_labels(server_name);
    let mut ports = vec![ServicePort {
        name: Some("http".to_string()),
        port: 80,
        target_port: Some(IntOrString::Int(port.unwrap_or(80) as i32)),
        ..Default::default()
    }];
    if let Some(p) = port {
        ports.push(ServicePort {
            name: Some("mcp".to_string()),
            port: 8080,
            target_port: Some(IntOrString::Int(p as i32)),
            ..Default::default()
        });
    }

    Service {
        metadata: K8sObjectMeta {
            name: Some(server_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec { selector: Some(labels), ports: Some(ports), ..Default::default() }),
        ..Default::default()
    }
}

/// `obot-revision = hash(envSecret ⊕ filesSecret ⊕ webhooks)` (spec.md
/// §4.F). Files/webhooks are not modeled yet, so the revision is derived
/// from the env secret's content alone — still stable across unchanged
/// inputs, which is the invariant the annotation exists to preserve.
pub fn compute_revision(manifest: &Manifest) -> String {
    crate::utils::hash_value(&manifest.env)
}

pub fn render(namespace: &str, server: &ServerRecord, settings: &K8sSettings) -> RenderedObjects {
    let revision = compute_revision(&server.spec.manifest);
    let port = match &server.spec.manifest.runtime {
        RuntimeConfig::Containerized { port, .. } => Some(*port),
        _ => None,
    };
    RenderedObjects {
        env_secret: render_env_secret(namespace, &server.meta.name, &server.spec.manifest),
        deployment: render_deployment(namespace, server, settings, &revision),
        service: render_service(namespace, &server.meta.name, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServerSpec, ServerStatus};

    fn server() -> ServerRecord {
        ServerRecord {
            meta: crate::model::ObjectMeta::new("ns", "s1"),
            spec: ServerSpec {
                user_id: "u1".into(),
                catalog_entry_id: None,
                catalog_id: None,
                workspace_id: None,
                composite_name: None,
                shared_within_mcp_catalog_name: None,
                manifest: Manifest {
                    runtime: RuntimeConfig::Containerized {
                        image: "img:latest".into(),
                        command: None,
                        args: vec![],
                        port: 9000,
                        path: None,
                    },
                    env: vec![EnvVar { key: "A".into(), required: true, sensitive: false, value: Some("1".into()) }],
                },
                needs_url: false,
                previous_url: None,
            },
            status: ServerStatus::default(),
        }
    }

    #[test]
    fn revision_is_stable_across_identical_manifests() {
        let s = server();
        assert_eq!(compute_revision(&s.spec.manifest), compute_revision(&s.spec.manifest));
    }

    #[test]
    fn render_sets_owner_labels_on_every_object() {
        let settings = K8sSettings::default();
        let rendered = render("ns", &server(), &settings);
        assert_eq!(
            rendered.deployment.metadata.labels.as_ref().unwrap().get(OWNER_LABEL),
            Some(&"s1".to_string())
        );
        assert_eq!(
            rendered.service.metadata.labels.as_ref().unwrap().get(OWNER_LABEL),
            Some(&"s1".to_string())
        );
    }

    #[test]
    fn containerized_service_exposes_both_ports() {
        let settings = K8sSettings::default();
        let rendered = render("ns", &server(), &settings);
        assert_eq!(rendered.service.spec.unwrap().ports.unwrap().len(), 2);
    }
}
