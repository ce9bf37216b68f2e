use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

use crate::{
    config::StorageConfig,
    error::{PipelineResult, StorageError},
    model::ModelArtifact,
};

/// Minimal blob store surface used for model artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether `bucket` exists and is visible.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;
    /// Stores `bytes` under `bucket/key`, replacing any previous object.
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
    /// Reads `bucket/key`.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Whether `name` is a single file name with no directory part.
#[must_use]
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn is_relative_key(key: &str) -> bool {
    let path = Path::new(key);
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Buckets as directories under a root.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Store rooted at `root`; buckets are its immediate subdirectories.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates `bucket` if it does not exist.
    pub async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.root.join(bucket)).await?;
        Ok(())
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        if !is_plain_file_name(bucket) {
            return Err(StorageError::MissingBucket(bucket.to_string()));
        }
        if !is_relative_key(key) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.bucket_dir(bucket).join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        match tokio::fs::metadata(self.bucket_dir(bucket)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        if !self.bucket_exists(bucket).await? {
            return Err(StorageError::MissingBucket(bucket.to_string()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key)?;
        if !self.bucket_exists(bucket).await? {
            return Err(StorageError::MissingBucket(bucket.to_string()));
        }
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StorageError::MissingBlob {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Deserialize)]
struct CredentialsFile {
    access_token: Option<String>,
}

/// Google Cloud Storage through its JSON API.
#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    client: Client,
    endpoint: Url,
    token: String,
}

impl GcsObjectStore {
    /// Reads a bearer token from `config.credentials_path`.
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::from_credentials_file(&config.credentials_path, &config.endpoint)
    }

    /// Reads `access_token` from the JSON credentials document at `path`.
    pub fn from_credentials_file(path: &Path, endpoint: &str) -> Result<Self, StorageError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            StorageError::MissingCredentials(format!("reading {}: {err}", path.display()))
        })?;
        let credentials: CredentialsFile = serde_json::from_str(&raw).map_err(|err| {
            StorageError::MissingCredentials(format!("parsing {}: {err}", path.display()))
        })?;
        let token = credentials
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                StorageError::MissingCredentials(format!("{} has no access_token", path.display()))
            })?;
        Self::new(endpoint, token)
    }

    /// Store with an explicit token.
    pub fn new(endpoint: &str, token: impl Into<String>) -> Result<Self, StorageError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| StorageError::Http(format!("invalid endpoint '{endpoint}': {err}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(StorageError::Http(format!("invalid endpoint '{endpoint}'")));
        }
        let client = Client::builder().user_agent("cardata-pipeline/0.1").build()?;
        Ok(Self {
            client,
            endpoint,
            token: token.into(),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn bucket_url(&self, bucket: &str) -> Url {
        self.url(&["storage", "v1", "b", bucket])
    }

    fn download_url(&self, bucket: &str, key: &str) -> Url {
        let mut url = self.url(&["storage", "v1", "b", bucket, "o", key]);
        url.query_pairs_mut().append_pair("alt", "media");
        url
    }

    fn upload_url(&self, bucket: &str, key: &str) -> Url {
        let mut url = self.url(&["upload", "storage", "v1", "b", bucket, "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);
        url
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let response = self
            .client
            .get(self.bucket_url(bucket))
            .bearer_auth(&self.token)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                StorageError::MissingCredentials(format!("access to bucket '{bucket}' denied")),
            ),
            _ => {
                response.error_for_status()?;
                Ok(true)
            }
        }
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let response = self
            .client
            .post(self.upload_url(bucket, key))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::MissingBucket(bucket.to_string()));
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get(self.download_url(bucket, key))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::MissingBlob {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Saves, uploads, downloads and loads model artifacts for one bucket.
#[derive(Clone)]
pub struct ModelArtifactStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    artifact_dir: PathBuf,
}

impl std::fmt::Debug for ModelArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelArtifactStore")
            .field("bucket", &self.bucket)
            .field("artifact_dir", &self.artifact_dir)
            .finish_non_exhaustive()
    }
}

impl ModelArtifactStore {
    /// Resolves the bucket for `bucket_suffix` and fails if it does not exist.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        config: &StorageConfig,
        bucket_suffix: &str,
    ) -> Result<Self, StorageError> {
        let bucket = config.bucket_name(bucket_suffix);
        if !store.bucket_exists(&bucket).await? {
            return Err(StorageError::MissingBucket(bucket));
        }
        Ok(Self {
            store,
            bucket,
            artifact_dir: config.artifact_dir.clone(),
        })
    }

    /// Bucket in use.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Local path of `model_file`.
    #[must_use]
    pub fn local_path(&self, model_file: &str) -> PathBuf {
        self.artifact_dir.join(model_file)
    }

    fn checked_local_path(&self, model_file: &str) -> Result<PathBuf, StorageError> {
        if is_plain_file_name(model_file) {
            Ok(self.local_path(model_file))
        } else {
            Err(StorageError::InvalidKey(model_file.to_string()))
        }
    }

    /// Writes the artifact under the local artifact directory.
    pub async fn save_local(&self, artifact: &ModelArtifact) -> PipelineResult<PathBuf> {
        let path = self.checked_local_path(&artifact.model_file)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::from)?;
        }
        tokio::fs::write(&path, artifact.to_json_bytes()?)
            .await
            .map_err(StorageError::from)?;
        Ok(path)
    }

    /// Uploads a local file under `model_file`; returns the object key.
    pub async fn upload(&self, local_path: &Path, model_file: &str) -> Result<String, StorageError> {
        let bytes = tokio::fs::read(local_path).await?;
        self.store.put(&self.bucket, model_file, bytes).await?;
        Ok(model_file.to_string())
    }

    /// Saves locally then uploads; returns the object key.
    pub async fn save(&self, artifact: &ModelArtifact) -> PipelineResult<String> {
        let path = self.save_local(artifact).await?;
        Ok(self.upload(&path, &artifact.model_file).await?)
    }

    /// Downloads `model_file` into the artifact directory.
    pub async fn download(&self, model_file: &str) -> Result<PathBuf, StorageError> {
        let path = self.checked_local_path(model_file)?;
        let bytes = self.store.get(&self.bucket, model_file).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Downloads and parses `model_file`.
    pub async fn load(&self, model_file: &str) -> PipelineResult<ModelArtifact> {
        let path = self.download(model_file).await?;
        let bytes = tokio::fs::read(&path).await.map_err(StorageError::from)?;
        Ok(ModelArtifact::from_json_bytes(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ModelConfig, error::PipelineError, model::Autoencoder};

    fn config_in(dir: &Path) -> StorageConfig {
        StorageConfig {
            artifact_dir: dir.join("models"),
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn open_fails_fast_on_missing_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path().join("buckets")));
        let err = ModelArtifactStore::open(store, &config_in(dir.path()), "prod")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingBucket(name) if name == "tf-models_prod"));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = FsObjectStore::new(dir.path().join("buckets"));
        fs_store.create_bucket("tf-models_dev").await.unwrap();
        let artifacts = ModelArtifactStore::open(Arc::new(fs_store.clone()), &config_in(dir.path()), "dev")
            .await
            .unwrap();

        let model = Autoencoder::new(&ModelConfig::default()).unwrap();
        let artifact = model.to_artifact("car-model.json", None);
        let key = artifacts.save(&artifact).await.unwrap();
        assert_eq!(key, "car-model.json");
        assert!(fs_store.root().join("tf-models_dev/car-model.json").is_file());

        tokio::fs::remove_file(artifacts.local_path("car-model.json"))
            .await
            .unwrap();
        let loaded = artifacts.load("car-model.json").await.unwrap();
        assert_eq!(loaded.layers, artifact.layers);
        assert!(artifacts.local_path("car-model.json").is_file());
    }

    #[tokio::test]
    async fn missing_blob_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = FsObjectStore::new(dir.path());
        fs_store.create_bucket("tf-models_x").await.unwrap();
        let artifacts = ModelArtifactStore::open(Arc::new(fs_store), &config_in(dir.path()), "x")
            .await
            .unwrap();
        let err = artifacts.load("absent.json").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Storage(StorageError::MissingBlob { ref key, .. }) if key == "absent.json"
        ));
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_bucket_or_artifact_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = FsObjectStore::new(dir.path().join("buckets"));
        fs_store.create_bucket("tf-models_dev").await.unwrap();

        for key in ["../../escaped.json", "/abs-model.json", "./m.json", ""] {
            assert!(
                matches!(
                    fs_store.put("tf-models_dev", key, b"{}".to_vec()).await,
                    Err(StorageError::InvalidKey(_))
                ),
                "put accepted {key:?}"
            );
            assert!(matches!(
                fs_store.get("tf-models_dev", key).await,
                Err(StorageError::InvalidKey(_))
            ));
        }
        fs_store.put("tf-models_dev", "nested/m.json", b"{}".to_vec()).await.unwrap();
        assert!(fs_store.root().join("tf-models_dev/nested/m.json").is_file());
        assert!(!dir.path().join("escaped.json").exists());

        let artifacts = ModelArtifactStore::open(Arc::new(fs_store), &config_in(dir.path()), "dev")
            .await
            .unwrap();
        let model = Autoencoder::new(&ModelConfig::default()).unwrap();
        let err = artifacts
            .save(&model.to_artifact("../../escaped.json", None))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(StorageError::InvalidKey(_))));
        assert!(!dir.path().join("escaped.json").exists());
        assert!(matches!(
            artifacts.download("/abs-model.json").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn plain_file_names_have_a_single_normal_component() {
        assert!(is_plain_file_name("car-autoencoder.json"));
        for name in ["/car.h5", "../car.h5", "dir/car.h5", ".", ""] {
            assert!(!is_plain_file_name(name), "{name:?}");
        }
    }

    #[test]
    fn gcs_requires_credentials_file_with_token() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            GcsObjectStore::from_credentials_file(&missing, "https://storage.googleapis.com"),
            Err(StorageError::MissingCredentials(_))
        ));

        let tokenless = dir.path().join("creds.json");
        std::fs::write(&tokenless, r#"{"client_email":"svc@example.com"}"#).unwrap();
        assert!(matches!(
            GcsObjectStore::from_credentials_file(&tokenless, "https://storage.googleapis.com"),
            Err(StorageError::MissingCredentials(_))
        ));
    }

    #[test]
    fn gcs_urls_escape_object_keys() {
        let store = GcsObjectStore::new("https://storage.googleapis.com", "t").unwrap();
        assert_eq!(
            store.download_url("tf-models_a", "dir/m.json").as_str(),
            "https://storage.googleapis.com/storage/v1/b/tf-models_a/o/dir%2Fm.json?alt=media"
        );
        assert_eq!(
            store.upload_url("tf-models_a", "m.json").as_str(),
            "https://storage.googleapis.com/upload/storage/v1/b/tf-models_a/o?uploadType=media&name=m.json"
        );
    }
}
