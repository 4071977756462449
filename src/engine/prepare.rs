//! Image preparation: make the configured image available and name it.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::ImageSource;
use crate::docker::{ContainerDriver, recipe};
use crate::events::{EventStatus, PipelineEvent};

use super::{EventSink, LOG_CHANNEL_CAPACITY, RunAborted};

/// Namespace for images built from a repository's own recipe.
const BUILT_IMAGE_NAMESPACE: &str = "hookci";

/// Cache tag for a built image: namespace, repository basename, content
/// fingerprint of the recipe. Only the recipe's bytes key the cache; other
/// build-context files deliberately do not invalidate it.
fn built_image_tag(workdir: &Path, fingerprint: &str) -> String {
    let repo = workdir
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("repo")
        .to_lowercase();
    format!("{BUILT_IMAGE_NAMESPACE}/{repo}:{fingerprint}")
}

/// Produces the tag the pipeline will run against, pulling or building as
/// needed. `None` means preparation failed; the failure events have already
/// been emitted and the caller only has to close the pipeline.
pub(crate) async fn prepare_image(
    source: &ImageSource,
    driver: &Arc<dyn ContainerDriver>,
    workdir: &Path,
    events: &EventSink,
) -> Result<Option<String>, RunAborted> {
    match source {
        ImageSource::Registry(reference) => prepare_registry(reference, driver, events).await,
        ImageSource::Recipe(relative) => {
            prepare_recipe(&workdir.join(relative), driver, workdir, events).await
        }
    }
}

async fn prepare_registry(
    reference: &str,
    driver: &Arc<dyn ContainerDriver>,
    events: &EventSink,
) -> Result<Option<String>, RunAborted> {
    match driver.image_exists(reference).await {
        Ok(true) => {
            debug!(image = %reference, "image already present");
            return Ok(Some(reference.to_string()));
        }
        Ok(false) => {}
        // An inspect hiccup should not block a pull that may still succeed.
        Err(e) => warn!(image = %reference, error = %e, "image cache check failed"),
    }

    events
        .emit(PipelineEvent::ImagePullStart {
            image_name: reference.to_string(),
        })
        .await?;
    match driver.pull_image(reference).await {
        Ok(()) => {
            events
                .emit(PipelineEvent::ImagePullEnd {
                    status: EventStatus::Success,
                })
                .await?;
            Ok(Some(reference.to_string()))
        }
        Err(e) => {
            error!(image = %reference, error = %e, "image pull failed");
            events
                .emit(PipelineEvent::ImagePullEnd {
                    status: EventStatus::Failure,
                })
                .await?;
            Ok(None)
        }
    }
}

async fn prepare_recipe(
    recipe_path: &Path,
    driver: &Arc<dyn ContainerDriver>,
    workdir: &Path,
    events: &EventSink,
) -> Result<Option<String>, RunAborted> {
    let fingerprint = match recipe::fingerprint(recipe_path) {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            error!(recipe = %recipe_path.display(), error = %e, "could not fingerprint recipe");
            return Ok(None);
        }
    };
    let tag = built_image_tag(workdir, &fingerprint);

    match driver.image_exists(&tag).await {
        Ok(true) => {
            debug!(tag = %tag, "recipe image cache hit");
            return Ok(Some(tag));
        }
        Ok(false) => {}
        Err(e) => warn!(tag = %tag, error = %e, "image cache check failed"),
    }

    let total_steps = match recipe::count_steps(recipe_path) {
        Ok(count) => count,
        Err(e) => {
            error!(recipe = %recipe_path.display(), error = %e, "could not read recipe");
            return Ok(None);
        }
    };

    events
        .emit(PipelineEvent::ImageBuildStart {
            dockerfile_path: recipe_path.display().to_string(),
            tag: tag.clone(),
            total_steps,
        })
        .await?;

    let (progress_tx, mut progress_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let task = {
        let driver = Arc::clone(driver);
        let recipe_path = recipe_path.to_path_buf();
        let tag = tag.clone();
        tokio::spawn(async move { driver.build_image(&recipe_path, &tag, progress_tx).await })
    };

    let mut delivery = Ok(());
    while let Some((step, line)) = progress_rx.recv().await {
        if let Err(aborted) = events
            .emit(PipelineEvent::ImageBuildProgress { step, line })
            .await
        {
            delivery = Err(aborted);
            break;
        }
    }
    // Let the build task finish even on consumer abandonment; closing the
    // progress channel unblocks any send it is still parked on.
    drop(progress_rx);
    let result = task.await;
    delivery?;

    let built = match result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(tag = %tag, error = %e, "image build failed");
            false
        }
        Err(e) => {
            error!(tag = %tag, error = %e, "image build task died");
            false
        }
    };

    let status = if built {
        EventStatus::Success
    } else {
        EventStatus::Failure
    };
    events
        .emit(PipelineEvent::ImageBuildEnd { status })
        .await?;
    Ok(built.then_some(tag))
}
