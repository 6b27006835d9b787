// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image snapshot step.

use std::sync::Arc;

use async_trait::async_trait;
use fleetplane_core::{ExecutionContext, RetryPolicy, Step, StepError, WaitBudget, wait_until};
use tracing::info;

use super::{gone_ok, keys, required};
use crate::cloud::{ImageApi, ImageStatus};

/// Snapshot the stopped builder instance and wait for the image to become available.
pub struct CreateImage {
    images: Arc<dyn ImageApi>,
    name: String,
    wait: WaitBudget,
    retry: RetryPolicy,
}

impl CreateImage {
    /// Step producing the image called `name`.
    pub fn new(
        images: Arc<dyn ImageApi>,
        name: impl Into<String>,
        wait: WaitBudget,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            images,
            name: name.into(),
            wait,
            retry,
        }
    }
}

#[async_trait]
impl Step for CreateImage {
    fn name(&self) -> &str {
        "create-image"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let image = match self.images.find_image(&self.name).await? {
            Some(image) => image,
            None => {
                let instance_id = required(ctx, keys::BUILDER_INSTANCE_ID)?;
                let image = self.images.create_image(&self.name, instance_id).await?;
                info!(image_id = %image.image_id, instance_id, "Image build started");
                image
            }
        };

        let image_id = image.image_id;
        let what = format!("image {image_id}");
        wait_until(self.wait, &what, || {
            let images = self.images.clone();
            let image_id = image_id.clone();
            async move {
                match images.get_image(&image_id).await?.status {
                    ImageStatus::Available => Ok(Some(())),
                    ImageStatus::Building => Ok(None),
                    ImageStatus::Error => Err(StepError::Terminal(format!(
                        "image '{image_id}' failed to build"
                    ))),
                }
            }
        })
        .await?;

        info!(image_id = %image_id, name = %self.name, "Image available");
        Ok(ExecutionContext::new().with(keys::IMAGE_ID, image_id))
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<Vec<String>, StepError> {
        let image_id = match ctx.get_str(keys::IMAGE_ID) {
            Some(id) => Some(id.to_string()),
            None => self.images.find_image(&self.name).await?.map(|i| i.image_id),
        };
        if let Some(image_id) = image_id {
            gone_ok(self.images.delete_image(&image_id).await)?;
        }
        Ok(vec![keys::IMAGE_ID.to_string()])
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}
