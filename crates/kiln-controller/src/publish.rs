// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multi-arch manifest-list publishing.
//!
//! For each per-arch image pushed by a worker, the publisher fetches the
//! raw image manifest from the registry (digest and canonical size must
//! come from the stored bytes), assembles an image index with platform
//! descriptors, and pushes the index to the build's global destination.

use async_trait::async_trait;
use kiln_core::manifest::RegistryCredential;
use kiln_core::reference::platform_for_arch;
use kiln_core::state::{BuildState, Level};
use oci_distribution::client::{Client, ClientConfig};
use oci_distribution::manifest::{
    ImageIndexEntry, OciImageIndex, Platform, IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("missing result for task {task_id:?} (available: {keys:?}, expected {expected}, received {received})")]
    MissingResult { task_id: String, keys: Vec<String>, expected: usize, received: usize },

    #[error("task {task_id} build failed: {error}")]
    TaskFailed { task_id: String, error: String },

    #[error("unsupported arch for manifest list: {0}")]
    UnsupportedArch(String),

    #[error("parse reference {reference:?}: {message}")]
    Reference { reference: String, message: String },

    #[error("fetch manifest {reference}: {message}")]
    Fetch { reference: String, message: String },

    #[error("push manifest list: {0}")]
    Push(String),
}

/// One per-arch image bound into the manifest list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformImage {
    pub arch: String,
    pub image: String,
    pub digest: String,
}

/// Seam for manifest-list assembly, faked in orchestrator tests.
#[async_trait]
pub trait ManifestPublisher: Send + Sync {
    async fn publish(
        &self,
        state: &BuildState,
        images: &[PlatformImage],
        destination: &str,
        credentials: &[RegistryCredential],
    ) -> Result<(), PublishError>;
}

/// Production publisher backed by the OCI distribution API.
#[derive(Default)]
pub struct RegistryPublisher;

impl RegistryPublisher {
    pub fn new() -> Self {
        Self
    }

    fn auth_for(registry: &str, credentials: &[RegistryCredential]) -> RegistryAuth {
        credentials
            .iter()
            .find(|cred| cred.registry == registry)
            .map(|cred| RegistryAuth::Basic(cred.username.clone(), cred.password.clone()))
            .unwrap_or(RegistryAuth::Anonymous)
    }
}

#[async_trait]
impl ManifestPublisher for RegistryPublisher {
    async fn publish(
        &self,
        state: &BuildState,
        images: &[PlatformImage],
        destination: &str,
        credentials: &[RegistryCredential],
    ) -> Result<(), PublishError> {
        state.append_log(Level::Info, format!("creating manifest list for {destination}"));

        let mut client = Client::new(ClientConfig::default());
        let mut entries = Vec::with_capacity(images.len());

        for image in images {
            let reference =
                Reference::try_from(image.image.as_str()).map_err(|e| PublishError::Reference {
                    reference: image.image.clone(),
                    message: e.to_string(),
                })?;
            let auth = Self::auth_for(reference.registry(), credentials);

            state.append_log(Level::Debug, format!("  fetching {reference}"));

            let (raw, digest) = client
                .pull_manifest_raw(
                    &reference,
                    &auth,
                    &[IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE],
                )
                .await
                .map_err(|e| PublishError::Fetch {
                    reference: reference.to_string(),
                    message: e.to_string(),
                })?;

            let media_type = serde_json::from_slice::<serde_json::Value>(&raw)
                .ok()
                .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| IMAGE_MANIFEST_MEDIA_TYPE.to_string());

            let platform = platform_for_arch(&image.arch)
                .ok_or_else(|| PublishError::UnsupportedArch(image.arch.clone()))?;

            entries.push(ImageIndexEntry {
                media_type,
                digest,
                size: raw.len() as i64,
                platform: Some(Platform {
                    architecture: platform.architecture.to_string(),
                    os: platform.os.to_string(),
                    os_version: None,
                    os_features: None,
                    variant: platform.variant.map(String::from),
                    features: None,
                }),
                annotations: None,
            });

            state.append_log(
                Level::Debug,
                format!("  added {}/{}", platform.os, platform.architecture),
            );
        }

        let index = OciImageIndex {
            schema_version: 2,
            media_type: Some(IMAGE_MANIFEST_LIST_MEDIA_TYPE.to_string()),
            manifests: entries,
            annotations: None,
        };

        let target =
            Reference::try_from(destination).map_err(|e| PublishError::Reference {
                reference: destination.to_string(),
                message: e.to_string(),
            })?;
        let auth = Self::auth_for(target.registry(), credentials);

        state.append_log(Level::Info, format!("pushing manifest list to {target}"));

        let url = client
            .push_manifest_list(&target, &auth, index)
            .await
            .map_err(|e| PublishError::Push(e.to_string()))?;

        state.append_log(Level::Info, format!("manifest list pushed: {url}"));
        Ok(())
    }
}
