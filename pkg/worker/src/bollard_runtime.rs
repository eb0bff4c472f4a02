//! `ContainerRuntime` backed by a local container engine over its Unix
//! socket, via `bollard`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding as BollardPortBinding, PortMap};
use bollard::Docker;
use futures_util::StreamExt;

use crate::error::WorkerError;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeState, RuntimeStatus};

pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    pub fn connect_local() -> Result<Self, WorkerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(BollardRuntime { docker })
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), WorkerError> {
        let options = CreateImageOptions { from_image: image, ..Default::default() };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, WorkerError> {
        let mut port_bindings: PortMap = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![BollardPortBinding {
                    host_ip: None,
                    host_port: port.host_port.map(|p| p.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                let ro = if m.read_only { ":ro" } else { "" };
                format!("{}:{}{}", m.host_path, m.container_path, ro)
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(binds),
            nano_cpus: Some((spec.limits.cpu_cores * 1_000_000_000.0) as i64),
            memory: Some(spec.limits.mem_bytes as i64),
            ..Default::default()
        };

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: spec.name.clone(), platform: None };
        let created = self.docker.create_container(Some(options), config).await?;
        Ok(created.id)
    }

    async fn start_container(&self, runtime_id: &str) -> Result<(), WorkerError> {
        self.docker.start_container(runtime_id, None::<StartContainerOptions<String>>).await?;
        Ok(())
    }

    async fn signal_container(&self, runtime_id: &str, signal: &str) -> Result<(), WorkerError> {
        let options = KillContainerOptions { signal: signal.to_string() };
        self.docker.kill_container(runtime_id, Some(options)).await?;
        Ok(())
    }

    async fn wait_container(&self, runtime_id: &str) -> Result<RuntimeStatus, WorkerError> {
        let mut stream = self.docker.wait_container(runtime_id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(result)) => {
                Ok(RuntimeStatus { state: RuntimeState::Exited, exit_code: Some(result.status_code as i32) })
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(RuntimeStatus { state: RuntimeState::Unknown, exit_code: None }),
        }
    }

    async fn status(&self, runtime_id: &str) -> Result<RuntimeStatus, WorkerError> {
        let inspect = self.docker.inspect_container(runtime_id, None).await?;
        let state = inspect.state.unwrap_or_default();
        let runtime_state = if state.running.unwrap_or(false) { RuntimeState::Running } else { RuntimeState::Exited };
        Ok(RuntimeStatus { state: runtime_state, exit_code: state.exit_code.map(|c| c as i32) })
    }

    async fn delete_container(&self, runtime_id: &str) -> Result<(), WorkerError> {
        let options = RemoveContainerOptions { force: true, ..Default::default() };
        self.docker.remove_container(runtime_id, Some(options)).await?;
        Ok(())
    }

    async fn exec(&self, runtime_id: &str, cmd: Vec<String>) -> Result<i64, WorkerError> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let exec = self
            .docker
            .create_exec(
                runtime_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            while output.next().await.is_some() {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }
}
