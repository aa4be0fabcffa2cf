//! Image builds
//!
//! The orchestrator consumes builds through the [`BuildPipeline`] trait:
//! fresh deploys build from an application's source bundle, redeploys layer
//! new environment data over the stored base image. [`DockerfileBuilder`]
//! shells out to `docker build` and streams its output into the logs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Result of a successful image build
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    /// Image reference to create containers from
    pub image: String,
    /// Port the built application listens on, by framework convention
    pub service_port: u16,
}

#[async_trait]
pub trait BuildPipeline: Send + Sync {
    /// Build an image from a source bundle
    async fn build(&self, source_path: &Path, name: &str) -> anyhow::Result<BuildArtifact>;

    /// Build a new image layered with environment data over a base image,
    /// returning the new reference
    async fn layer_env(
        &self,
        base_image: &str,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<String>;
}

/// Builds images with the local `docker build`
pub struct DockerfileBuilder {
    docker_path: String,
}

impl DockerfileBuilder {
    pub fn new(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
        }
    }

    /// Run `docker build -t <tag> <context>`, streaming output
    async fn run_build(&self, context: &Path, tag: &str) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.docker_path);
        cmd.arg("build").arg("-t").arg(tag).arg(context);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!("Running: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn docker build: {}", e))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line {
                        Ok(Some(line)) => info!(target: "docker", "{}", line),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Error reading build stdout: {}", e);
                            break;
                        }
                    }
                }
                line = stderr_reader.next_line() => {
                    match line {
                        Ok(Some(line)) => info!(target: "docker", "{}", line),
                        Ok(None) => {}
                        Err(e) => {
                            warn!("Error reading build stderr: {}", e);
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to wait for docker build: {}", e))?;

        if !status.success() {
            anyhow::bail!("docker build of '{}' exited with {}", tag, status);
        }

        Ok(())
    }
}

#[async_trait]
impl BuildPipeline for DockerfileBuilder {
    async fn build(&self, source_path: &Path, name: &str) -> anyhow::Result<BuildArtifact> {
        if !source_path.exists() {
            anyhow::bail!("Source path does not exist: {}", source_path.display());
        }
        if !source_path.join("Dockerfile").exists() {
            anyhow::bail!(
                "No Dockerfile in {}; build the project before deploying",
                source_path.display()
            );
        }

        let service_port = detect_service_port(source_path);
        let image = format!("{}:{}", name.to_lowercase(), Utc::now().timestamp_millis());

        info!(image = %image, source = %source_path.display(), "Building image");
        self.run_build(source_path, &image).await?;
        info!(image = %image, service_port, "Image built");

        Ok(BuildArtifact {
            image,
            service_port,
        })
    }

    async fn layer_env(
        &self,
        base_image: &str,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<String> {
        let context = tempfile::tempdir()
            .map_err(|e| anyhow::anyhow!("Failed to create build context: {}", e))?;

        let dockerfile = render_env_dockerfile(base_image, env);
        std::fs::write(context.path().join("Dockerfile"), dockerfile)
            .map_err(|e| anyhow::anyhow!("Failed to write build context: {}", e))?;

        let repository = base_image.split(':').next().unwrap_or(base_image);
        let image = format!("{}:{}", repository, Utc::now().timestamp_millis());

        info!(base = %base_image, image = %image, vars = env.len(), "Layering environment");
        self.run_build(context.path(), &image).await?;

        Ok(image)
    }
}

/// Service-port convention of the source bundle: vite apps serve their built
/// assets from nginx on 80, everything else is expected on 3000.
pub fn detect_service_port(source_path: &Path) -> u16 {
    if source_path.join("vite.config.js").exists() || source_path.join("vite.config.ts").exists() {
        80
    } else {
        3000
    }
}

/// Dockerfile that stacks ENV directives on top of a base image, keys sorted
/// so identical input yields an identical layer
fn render_env_dockerfile(base_image: &str, env: &HashMap<String, String>) -> String {
    let mut out = format!("FROM {}\n", base_image);

    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();

    for key in keys {
        let value = &env[key];
        out.push_str(&format!(
            "ENV {}=\"{}\"\n",
            key,
            value.replace('\\', "\\\\").replace('"', "\\\"")
        ));
    }

    out
}
