//! Container-backed sandbox: start a detached container over the scratch
//! dirs, wait out the time limit, inspect the result, clean up.

use std::{path::Path, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use bollard::{
    container::{Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions},
    image::{CreateImageOptions, ListImagesOptions},
    models::{Mount, MountTypeEnum},
    service::HostConfig,
    Docker,
};
use dashmap::DashSet;
use derive_builder::Builder;
use names::{Generator, Name};
use once_cell::sync::Lazy;
use path_absolutize::Absolutize;
use tokio_stream::StreamExt;

use super::workspace::RunDir;
use crate::proto::{FileRef, RunOptions, RunResult, RunVerdict};
use crate::store::FileStore;

/// Mount target of the input directory inside the container.
pub const INPUT_MOUNT: &str = "/judge/input/";
/// Mount target of the output directory inside the container.
pub const OUTPUT_MOUNT: &str = "/judge/output/";

/// Image ids this process has already seen locally.
static PULLED_IMAGES: Lazy<DashSet<String>> = Lazy::new(DashSet::new);

fn random_tag() -> String {
    Generator::with_naming(Name::Plain).next().unwrap()
}

/// Host-side settings for one container run.
#[derive(Debug, Builder)]
#[builder(setter(into, strip_option))]
pub struct ContainerRunConfig {
    /// Image id to run. Must already be pulled.
    image_id: String,

    /// Host-to-container bind mounts.
    #[builder(default)]
    mounts: Vec<Mount>,

    /// The memory limit of this container.
    #[builder(default)]
    mem_limit: Option<i64>,

    /// Whether network is allowed in this container.
    #[builder(default = "false")]
    network_enabled: bool,
}

/// Make sure `image_id` is available locally, pulling from `repository` on a
/// cache miss.
async fn ensure_image(docker: &Docker, repository: &str, image_id: &str) -> Result<()> {
    if PULLED_IMAGES.contains(image_id) {
        return Ok(());
    }

    refresh_local_images(docker).await?;
    if PULLED_IMAGES.contains(image_id) {
        return Ok(());
    }

    tracing::info!("pulling image {} from repository {}", image_id, repository);
    let pull = docker
        .create_image(
            Some(CreateImageOptions {
                from_image: repository.to_owned(),
                ..Default::default()
            }),
            None,
            None,
        )
        .collect::<Vec<_>>()
        .await;
    pull.into_iter()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("pulling repository {}", repository))?;

    refresh_local_images(docker).await?;
    if !PULLED_IMAGES.contains(image_id) {
        bail!(
            "image {} still missing after pulling repository {}",
            image_id,
            repository
        );
    }
    Ok(())
}

async fn refresh_local_images(docker: &Docker) -> Result<()> {
    let images = docker
        .list_images(Some(ListImagesOptions::<String> {
            all: true,
            ..Default::default()
        }))
        .await?;
    for image in images {
        // Ids come back as `sha256:<hex>`.
        let id = image.id.trim_start_matches("sha256:").to_owned();
        PULLED_IMAGES.insert(id);
    }
    Ok(())
}

fn bind_mount(source: &Path, target: &str, read_only: bool) -> Result<Mount> {
    let source = source.absolutize()?;
    Ok(Mount {
        target: Some(target.to_owned()),
        source: Some(source.display().to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(read_only),
        ..Default::default()
    })
}

async fn create_container(docker: &Docker, cfg: ContainerRunConfig) -> Result<String> {
    let name = format!("gavel_{}", random_tag());
    let res = docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.as_str(),
            }),
            Config::<String> {
                image: Some(cfg.image_id),
                network_disabled: Some(!cfg.network_enabled),
                host_config: Some(HostConfig {
                    mounts: Some(cfg.mounts),
                    memory: cfg.mem_limit,
                    memory_swap: cfg.mem_limit,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await?;
    Ok(res.id)
}

/// Start the container, sleep out the wall-clock limit, then decide the
/// verdict from its state.
async fn wait_for_verdict(docker: &Docker, id: &str, options: &RunOptions) -> Result<RunVerdict> {
    docker
        .start_container(id, None::<StartContainerOptions<String>>)
        .await?;

    tokio::time::sleep(Duration::from_secs_f64(options.time_limit)).await;

    let inspect = docker.inspect_container(id, None).await?;
    let state = inspect
        .state
        .ok_or_else(|| anyhow!("container state missing from inspect response"))?;
    if state.running.unwrap_or(false) {
        Ok(RunVerdict::TimeLimitExceeded)
    } else if state.exit_code.unwrap_or(0) != 0 {
        Ok(RunVerdict::NonZeroExit)
    } else {
        Ok(RunVerdict::Success)
    }
}

pub async fn run(
    docker: &Docker,
    repository: &str,
    image_id: &str,
    inputs: &[FileRef],
    options: &RunOptions,
    store: &FileStore,
) -> Result<RunResult> {
    ensure_image(docker, repository, image_id).await?;

    let dir = RunDir::create()?;
    dir.link_inputs(store, inputs)?;

    let cfg = ContainerRunConfigBuilder::default()
        .image_id(image_id)
        .mounts(vec![
            bind_mount(dir.input_dir(), INPUT_MOUNT, true)?,
            bind_mount(dir.output_dir(), OUTPUT_MOUNT, false)?,
        ])
        .mem_limit(options.memory_limit_bytes)
        .build()
        .map_err(|e| anyhow!("container config: {}", e))?;
    let id = create_container(docker, cfg).await?;

    // The container must be removed on every path from here on.
    let verdict = wait_for_verdict(docker, &id, options).await;
    if let Err(e) = docker
        .remove_container(
            &id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        tracing::warn!("failed to remove container {}: {}", id, e);
    }
    let verdict = verdict?;

    let outputs = dir.collect_outputs(store)?;
    Ok(RunResult { verdict, outputs })
}
