//! Pod specification builder for VS Code instances.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
    PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec, Probe,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use vscode_swarm_core::InstanceId;
use vscode_swarm_store::{AuthType, InstanceStatus, VSCodeInstance};

use super::KubernetesOptions;

/// Label selecting every pod managed by this provider.
pub const APP_LABEL: (&str, &str) = ("app", "vscode-instance");

/// Label carrying the short instance id.
pub const INSTANCE_ID_LABEL: &str = "vscode-swarm.io/instance-id";

/// Annotation carrying the full instance id.
pub const INSTANCE_ID_ANNOTATION: &str = "vscode-swarm.io/instance-id-full";

const WORKSPACE_MOUNT: &str = "/home/coder/project";
const HEALTH_PATH: &str = "/healthz";

/// Pod name for an instance.
#[must_use]
pub fn pod_name_for_instance(instance_id: &InstanceId) -> String {
    format!("vscode-{}", instance_id.short_hex())
}

/// Map a pod phase onto [`InstanceStatus`].
#[must_use]
pub fn map_pod_phase(phase: Option<&str>) -> InstanceStatus {
    match phase {
        Some("Pending") => InstanceStatus::Creating,
        Some("Running") => InstanceStatus::Running,
        Some("Succeeded") => InstanceStatus::Stopped,
        _ => InstanceStatus::Failed,
    }
}

/// Build the pod for an instance.
#[must_use]
pub fn build_pod(instance: &VSCodeInstance, options: &KubernetesOptions) -> Pod {
    Pod {
        metadata: build_metadata(instance, options),
        spec: Some(build_pod_spec(instance, options)),
        ..Default::default()
    }
}

fn build_metadata(instance: &VSCodeInstance, options: &KubernetesOptions) -> ObjectMeta {
    let labels = BTreeMap::from([
        (APP_LABEL.0.to_string(), APP_LABEL.1.to_string()),
        (INSTANCE_ID_LABEL.to_string(), instance.id.short_hex()),
    ]);
    let annotations = BTreeMap::from([
        (INSTANCE_ID_ANNOTATION.to_string(), instance.id.to_hex()),
        (
            "vscode-swarm.io/created-at".to_string(),
            instance.created_at.to_rfc3339(),
        ),
    ]);

    ObjectMeta {
        name: Some(instance.provider_instance_id.clone()),
        namespace: Some(options.namespace.clone()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn build_pod_spec(instance: &VSCodeInstance, options: &KubernetesOptions) -> PodSpec {
    PodSpec {
        containers: vec![build_container(instance, options)],
        volumes: Some(vec![build_workspace_volume(instance, options)]),
        restart_policy: Some("Always".to_string()),
        termination_grace_period_seconds: Some(30),
        security_context: Some(PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            fs_group: Some(1000),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_container(instance: &VSCodeInstance, options: &KubernetesOptions) -> Container {
    let port = i32::from(instance.config.container_port());
    let auth = match &instance.config.auth {
        Some(auth) if auth.auth_type == AuthType::Password => "password",
        _ => "none",
    };

    Container {
        name: "code-server".to_string(),
        image: Some(options.image.clone()),
        args: Some(vec![
            "--bind-addr".to_string(),
            format!("0.0.0.0:{port}"),
            "--auth".to_string(),
            auth.to_string(),
            WORKSPACE_MOUNT.to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: port,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        env: Some(build_env_vars(instance)),
        resources: Some(build_resources(instance)),
        volume_mounts: Some(vec![build_workspace_mount(instance, options)]),
        readiness_probe: Some(healthz_check(port, 5, 10)),
        liveness_probe: Some(healthz_check(port, 30, 30)),
        ..Default::default()
    }
}

fn build_env_vars(instance: &VSCodeInstance) -> Vec<EnvVar> {
    let mut vars: Vec<EnvVar> = instance
        .config
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    vars.push(EnvVar {
        name: "VSCODE_SWARM_INSTANCE_ID".to_string(),
        value: Some(instance.id.to_hex()),
        ..Default::default()
    });
    if !instance.config.extensions.is_empty() {
        vars.push(EnvVar {
            name: "VSCODE_EXTENSIONS".to_string(),
            value: Some(instance.config.extensions.join(",")),
            ..Default::default()
        });
    }
    if let Some(password) = instance
        .config
        .auth
        .as_ref()
        .filter(|a| a.auth_type == AuthType::Password)
        .and_then(|a| a.password.clone())
    {
        vars.push(EnvVar {
            name: "PASSWORD".to_string(),
            value: Some(password),
            ..Default::default()
        });
    }
    vars
}

fn build_resources(instance: &VSCodeInstance) -> ResourceRequirements {
    let resources = &instance.config.resources;

    let requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(resources.cpu.cores.to_string())),
        (
            "memory".to_string(),
            Quantity(format!("{}Mi", resources.memory.min)),
        ),
    ]);
    let limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(resources.cpu.cores.to_string())),
        (
            "memory".to_string(),
            Quantity(format!("{}Mi", resources.memory.max)),
        ),
    ]);

    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn build_workspace_volume(instance: &VSCodeInstance, options: &KubernetesOptions) -> Volume {
    match (&options.workspace_pvc, instance.config.resources.storage.persistent) {
        (Some(claim), true) => Volume {
            name: "workspace".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        _ => Volume {
            name: "workspace".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: Some(Quantity(format!(
                    "{}Gi",
                    instance.config.resources.storage.size
                ))),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

fn build_workspace_mount(instance: &VSCodeInstance, options: &KubernetesOptions) -> VolumeMount {
    let shared = options.workspace_pvc.is_some() && instance.config.resources.storage.persistent;
    VolumeMount {
        name: "workspace".to_string(),
        mount_path: WORKSPACE_MOUNT.to_string(),
        sub_path: shared.then(|| instance.id.to_hex()),
        ..Default::default()
    }
}

fn healthz_check(port: i32, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}
