//! Assembly of the pipeline from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use trackline_core::{
    ConnectivityMonitor, CredentialProvider, HttpUploader, NoCredentials, Pipeline,
    PipelineOptions, StaticToken, SummaryClient, SyncOptions, TcpProbe, TokenFile,
    UploaderOptions, shared_queue,
};
use trackline_store::QueueStore;

use crate::config::{AuthConfig, Config, ConfigError, StorageConfig};

/// Errors raised while assembling the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to open queue: {0}")]
    Store(#[from] trackline_store::Error),
    #[error("Failed to build pipeline: {0}")]
    Pipeline(#[from] trackline_core::Error),
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub endpoint: Option<String>,
}

impl Overrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(database) = self.database {
            config.storage.path = database;
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint.url = endpoint;
        }
    }
}

/// Credential provider for the configured auth source.
pub fn credentials(auth: &AuthConfig) -> Arc<dyn CredentialProvider> {
    match (&auth.token, &auth.token_file) {
        (Some(token), _) => Arc::new(StaticToken::new(token.clone())),
        (None, Some(path)) => Arc::new(TokenFile::new(path)),
        (None, None) => Arc::new(NoCredentials),
    }
}

/// Open the durable queue with the configured capacity.
pub fn open_queue(storage: &StorageConfig) -> Result<QueueStore, trackline_store::Error> {
    info!("Opening queue at {:?}", storage.path);
    Ok(QueueStore::open(&storage.path)?.with_capacity(storage.max_pending))
}

/// Build the full pipeline described by `config`. Nothing runs until
/// [`Pipeline::start`] or [`Pipeline::flush`] is called.
pub fn build_pipeline(config: &Config) -> Result<Pipeline, AgentError> {
    config.validate()?;

    let credentials = credentials(&config.auth);
    let queue = shared_queue(open_queue(&config.storage)?);

    let probe = TcpProbe::for_url(&config.endpoint.url, config.connectivity.probe_timeout())?;
    info!("Probing reachability of {}", probe.address());
    let monitor = Arc::new(ConnectivityMonitor::new(Arc::new(probe)));

    let uploader = HttpUploader::new(
        &config.endpoint.url,
        credentials.clone(),
        UploaderOptions::default().timeout(config.endpoint.timeout()),
    )?;
    info!("Uploading to {}", uploader.track_url());

    let sync = SyncOptions::default()
        .interval(config.sync.interval())
        .max_rejections(config.sync.rejection_limit())
        .upload_timeout(config.endpoint.timeout());
    let options = PipelineOptions::default()
        .sync(sync)
        .probe_interval(config.connectivity.probe_interval());

    Ok(Pipeline::new(
        queue,
        monitor,
        Arc::new(uploader),
        credentials,
        options,
    )?)
}

/// Client for the per-day summary query.
pub fn summary_client(config: &Config) -> Result<SummaryClient, AgentError> {
    Ok(SummaryClient::new(
        &config.endpoint.url,
        credentials(&config.auth),
        config.endpoint.timeout(),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.storage.path = dir.path().join("queue.db");
        config
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        Overrides {
            database: Some(PathBuf::from("/tmp/other.db")),
            endpoint: Some("https://collector.example.com".to_string()),
        }
        .apply(&mut config);

        assert_eq!(config.storage.path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.endpoint.url, "https://collector.example.com");

        let before = config.endpoint.url.clone();
        Overrides::default().apply(&mut config);
        assert_eq!(config.endpoint.url, before);
    }

    #[tokio::test]
    async fn test_credentials_selection() {
        let token = AuthConfig {
            token: Some("abc".to_string()),
            token_file: None,
        };
        assert_eq!(credentials(&token).token().await.as_deref(), Some("abc"));

        let none = AuthConfig::default();
        assert_eq!(credentials(&none).token().await, None);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "from-file\n").unwrap();
        let file = AuthConfig {
            token: None,
            token_file: Some(path),
        };
        assert_eq!(credentials(&file).token().await.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_open_queue_applies_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            path: dir.path().join("queue.db"),
            max_pending: Some(10),
        };
        let queue = open_queue(&storage).unwrap();
        assert_eq!(queue.capacity(), Some(10));
    }

    #[tokio::test]
    async fn test_build_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = build_pipeline(&config_in(&dir)).unwrap();
        assert_eq!(pipeline.queue().lock().await.pending_count().unwrap(), 0);
        assert_eq!(
            pipeline.engine().options().max_rejections,
            Config::default().sync.rejection_limit()
        );
    }

    #[test]
    fn test_build_pipeline_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.endpoint.url = "collector.example.com".to_string();

        assert!(matches!(
            build_pipeline(&config),
            Err(AgentError::Config(ConfigError::Validation(_)))
        ));
    }
}
