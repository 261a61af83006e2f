use crate::blobs::BlobStore;
use crate::gc::{GarbageCollector, GcReport};
use crate::layout::StoreLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use strata_schema::BlobDigest;
use tracing::debug;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_SQUASHFS: &str = "application/vnd.strata.image.layer.squashfs";

/// Points at a blob: what it is, its digest, and its size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: BlobDigest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: BlobDigest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    /// `None` only while a mutation is in progress; set on commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Default for ImageManifest {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_owned(),
            config: None,
            layers: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Execution parameters carried in the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub volumes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl RuntimeConfig {
    /// Set `KEY=VALUE` in the environment list, replacing an existing key.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let prefix = format!("{key}=");
        let entry = format!("{key}={value}");
        if let Some(existing) = self.env.iter_mut().find(|e| e.starts_with(&prefix)) {
            *existing = entry;
        } else {
            self.env.push(entry);
        }
    }

    pub fn has_env(&self, key: &str) -> bool {
        let prefix = format!("{key}=");
        self.env.iter().any(|e| e.starts_with(&prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".to_owned(),
            diff_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

/// An image being edited: starts as a copy of a base image (or empty) and is
/// turned into a new manifest by [`ImageStore::commit_mutation`].
#[derive(Debug, Clone)]
pub struct Mutation {
    pub base: Option<Descriptor>,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
}

impl Mutation {
    /// Append a layer. Layers are stored uncompressed, so the diff id is the
    /// blob digest.
    pub fn add_layer(&mut self, layer: Descriptor) {
        self.config
            .rootfs
            .diff_ids
            .push(format!("blake3:{}", layer.digest));
        self.manifest.layers.push(layer);
    }

    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.manifest.annotations.insert(key.into(), value.into());
    }
}

/// Content-addressable image storage with named references.
pub trait ImageStore {
    fn resolve_reference(&self, name: &str) -> Result<Option<Descriptor>, StoreError>;
    fn update_reference(&self, name: &str, descriptor: &Descriptor) -> Result<(), StoreError>;
    fn remove_reference(&self, name: &str) -> Result<(), StoreError>;
    fn list_references(&self) -> Result<Vec<String>, StoreError>;
    /// Store a blob as-is, without compression.
    fn add_blob(&self, media_type: &str, reader: &mut dyn Read) -> Result<Descriptor, StoreError>;
    fn has_blob(&self, digest: &str) -> bool;
    fn read_manifest(&self, descriptor: &Descriptor) -> Result<ImageManifest, StoreError>;
    fn read_config(&self, manifest: &ImageManifest) -> Result<ImageConfig, StoreError>;
    fn begin_mutation(&self, base: Option<&Descriptor>) -> Result<Mutation, StoreError>;
    fn commit_mutation(&self, mutation: Mutation) -> Result<Descriptor, StoreError>;
    /// Remove blobs unreachable from any reference or from `extra_roots`.
    fn gc(&self, extra_roots: &[Descriptor]) -> Result<GcReport, StoreError>;
}

/// Directory-backed [`ImageStore`]: blake3 blobs plus one JSON file per
/// reference.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    layout: StoreLayout,
    blobs: BlobStore,
}

impl ImageLayout {
    /// Open an image layout, creating it if needed.
    pub fn open(root: impl Into<std::path::PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        Ok(Self::from_layout(layout))
    }

    /// Open an existing layout without creating anything.
    pub fn open_existing(root: impl Into<std::path::PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        if !layout.is_initialized() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no image layout at {}", layout.root().display()),
            )));
        }
        layout.verify_version()?;
        Ok(Self::from_layout(layout))
    }

    fn from_layout(layout: StoreLayout) -> Self {
        let blobs = BlobStore::new(layout.clone());
        Self { layout, blobs }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    fn put_json<T: Serialize>(&self, media_type: &str, value: &T) -> Result<Descriptor, StoreError> {
        let data = serde_json::to_vec_pretty(value)?;
        let digest = self.blobs.put(&data)?;
        Ok(Descriptor::new(media_type, digest, data.len() as u64))
    }
}

fn validate_reference(name: &str) -> Result<(), StoreError> {
    strata_schema::validate_layer_name(name).map_err(|_| StoreError::InvalidName(name.to_owned()))
}

impl ImageStore for ImageLayout {
    fn resolve_reference(&self, name: &str) -> Result<Option<Descriptor>, StoreError> {
        validate_reference(name)?;
        let path = self.layout.ref_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn update_reference(&self, name: &str, descriptor: &Descriptor) -> Result<(), StoreError> {
        validate_reference(name)?;
        if !self.blobs.exists(&descriptor.digest) {
            return Err(StoreError::BlobNotFound(descriptor.digest.to_string()));
        }
        let content = serde_json::to_string_pretty(descriptor)?;
        crate::write_atomic(&self.layout.ref_path(name), content.as_bytes())?;
        debug!("reference {name} -> {}", descriptor.digest.short());
        Ok(())
    }

    fn remove_reference(&self, name: &str) -> Result<(), StoreError> {
        validate_reference(name)?;
        let path = self.layout.ref_path(name);
        if path.exists() {
            fs::remove_file(path)?;
            crate::fsync_dir(&self.layout.refs_dir())?;
        }
        Ok(())
    }

    fn list_references(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.refs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if !stem.starts_with('.') {
                        names.push(stem.to_owned());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn add_blob(&self, media_type: &str, reader: &mut dyn Read) -> Result<Descriptor, StoreError> {
        let (digest, size) = self.blobs.put_reader(reader)?;
        Ok(Descriptor::new(media_type, digest, size))
    }

    fn has_blob(&self, digest: &str) -> bool {
        self.blobs.exists(digest)
    }

    fn read_manifest(&self, descriptor: &Descriptor) -> Result<ImageManifest, StoreError> {
        let data = self.blobs.get(&descriptor.digest)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn read_config(&self, manifest: &ImageManifest) -> Result<ImageConfig, StoreError> {
        match &manifest.config {
            Some(config) => {
                let data = self.blobs.get(&config.digest)?;
                Ok(serde_json::from_slice(&data)?)
            }
            None => Ok(ImageConfig::default()),
        }
    }

    fn begin_mutation(&self, base: Option<&Descriptor>) -> Result<Mutation, StoreError> {
        let Some(base) = base else {
            return Ok(Mutation {
                base: None,
                manifest: ImageManifest::default(),
                config: ImageConfig::default(),
            });
        };
        let manifest = self.read_manifest(base)?;
        let config = self.read_config(&manifest)?;
        Ok(Mutation {
            base: Some(base.clone()),
            manifest,
            config,
        })
    }

    fn commit_mutation(&self, mutation: Mutation) -> Result<Descriptor, StoreError> {
        let Mutation {
            mut manifest,
            config,
            ..
        } = mutation;
        manifest.config = Some(self.put_json(MEDIA_TYPE_CONFIG, &config)?);
        self.put_json(MEDIA_TYPE_MANIFEST, &manifest)
    }

    fn gc(&self, extra_roots: &[Descriptor]) -> Result<GcReport, StoreError> {
        GarbageCollector::new(self.layout.clone()).collect(extra_roots, false)
    }
}
