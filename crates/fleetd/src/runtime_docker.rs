//! Docker-backed container runtime

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, RestartContainerOptions, StopContainerOptions,
};
use bollard::image::ListImagesOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortMap};
use bollard::Docker;
use chrono::{DateTime, Utc};
use fleet_core::caps::{async_trait, ContainerRuntime};
use fleet_core::models::{
    BindMount, ContainerDetail, ContainerSpec, ContainerSummary, ImageInfo, MountPoint,
    PortBinding,
};
use std::collections::HashMap;

/// Runtime adapter speaking to the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("could not reach the docker daemon")?;
        Ok(Self { docker })
    }
}

fn bind_arg(bind: &BindMount) -> String {
    if bind.read_only {
        format!("{}:{}:ro", bind.host_path, bind.container_path)
    } else {
        format!("{}:{}", bind.host_path, bind.container_path)
    }
}

/// Docker reports "0001-01-01T00:00:00Z" for events that never happened;
/// anything unparseable collapses to the epoch the same way.
fn parse_ts(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Flatten Docker's "8000/tcp" port map into container/host pairs.
fn flatten_ports(ports: Option<&PortMap>) -> Vec<PortBinding> {
    let mut out = Vec::new();
    let Some(ports) = ports else {
        return out;
    };
    for (key, bindings) in ports {
        let Some(container_port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let host_port = bindings
            .iter()
            .flatten()
            .find_map(|b| b.host_port.as_deref().and_then(|p| p.parse::<u16>().ok()));
        if let Some(host_port) = host_port {
            out.push(PortBinding {
                container_port,
                host_port,
            });
        }
    }
    out
}

fn detail_from_inspect(resp: ContainerInspectResponse) -> ContainerDetail {
    let state = resp.state.as_ref();
    let host_config = resp.host_config.as_ref();

    ContainerDetail {
        id: resp.id.clone().unwrap_or_default(),
        name: resp
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: resp.image.clone().unwrap_or_default(),
        created: parse_ts(resp.created.as_deref()),
        started_at: parse_ts(state.and_then(|s| s.started_at.as_deref())),
        finished_at: parse_ts(state.and_then(|s| s.finished_at.as_deref())),
        running: state.and_then(|s| s.running).unwrap_or(false),
        restarting: state.and_then(|s| s.restarting).unwrap_or(false),
        ports: flatten_ports(resp.network_settings.as_ref().and_then(|n| n.ports.as_ref())),
        mounts: resp
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| MountPoint {
                source: m.source.unwrap_or_default(),
                destination: m.destination.unwrap_or_default(),
            })
            .collect(),
        cpu_shares: host_config.and_then(|h| h.cpu_shares).unwrap_or(0),
        memory_bytes: host_config.and_then(|h| h.memory).unwrap_or(0),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.iter().map(bind_arg).collect())
            },
            cpu_shares: Some(spec.cpu_shares),
            memory: Some(spec.memory_bytes),
            // Host ports are picked by the daemon; they come back on inspect.
            publish_all_ports: Some(true),
            ..Default::default()
        };

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|p| (format!("{p}/tcp"), HashMap::new()))
            .collect();

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let resp = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .with_context(|| format!("could not create container {}", spec.name))?;
        Ok(resp.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .with_context(|| format!("could not start container {id}"))
    }

    async fn stop(&self, id: &str, timeout_secs: u32) -> Result<()> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout_secs as i64,
                }),
            )
            .await
            .with_context(|| format!("could not stop container {id}"))
    }

    async fn restart(&self, id: &str, timeout_secs: u32) -> Result<()> {
        self.docker
            .restart_container(
                id,
                Some(RestartContainerOptions {
                    t: timeout_secs as isize,
                }),
            )
            .await
            .with_context(|| format!("could not restart container {id}"))
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .with_context(|| format!("could not kill container {id}"))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("could not remove container {id}"))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetail> {
        let resp = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("could not inspect container {id}"))?;
        Ok(detail_from_inspect(resp))
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all,
                ..Default::default()
            }))
            .await
            .context("could not list containers")?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|n| n.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string()),
                status: c.status.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("could not list images")?;

        Ok(images
            .into_iter()
            .map(|i| ImageInfo {
                id: i.id,
                tags: i.repo_tags,
            })
            .collect())
    }
}
