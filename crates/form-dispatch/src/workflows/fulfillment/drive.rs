use std::fmt::Debug;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use google_drive3::api::{File, Permission, Scope};
use google_drive3::{hyper_rustls, hyper_util, yup_oauth2, DriveHub};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unable to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("drive operation failed: {0}")]
    Backend(String),
    #[error("drive returned no {0} for the uploaded file")]
    MissingField(&'static str),
    #[error("drive credentials unusable: {0}")]
    Credentials(String),
}

/// Publishes a local file and returns a link anyone can open.
#[async_trait]
pub trait DocumentStore: Send + Sync + Debug {
    async fn publish(&self, path: &Path, remote_name: &str) -> Result<String, StoreError>;
}

/// Thin wrapper around the generated google-drive3 client: upload into one
/// folder, then grant `anyone` reader access.
pub struct GoogleDriveStore<C>
where
    C: google_drive3::common::Connector + Send + Sync + 'static,
{
    hub: DriveHub<C>,
    folder_id: String,
}

pub type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

impl GoogleDriveStore<HttpsConnector> {
    /// Authenticate with a service-account key file.
    pub async fn from_service_account(
        credentials_path: &Path,
        folder_id: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let key = yup_oauth2::read_service_account_key(credentials_path)
            .await
            .map_err(|err| StoreError::Credentials(err.to_string()))?;
        let auth = yup_oauth2::ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(|err| StoreError::Credentials(err.to_string()))?;

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| StoreError::Credentials(err.to_string()))?
            .https_or_http()
            .enable_http1()
            .build();
        let client =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build(connector);

        Ok(Self::new(DriveHub::new(client, auth), folder_id))
    }
}

impl<C> GoogleDriveStore<C>
where
    C: google_drive3::common::Connector + Send + Sync + 'static,
{
    pub fn new(hub: DriveHub<C>, folder_id: impl Into<String>) -> Self {
        Self {
            hub,
            folder_id: folder_id.into(),
        }
    }

    fn map_error<E: std::fmt::Display>(err: E) -> StoreError {
        StoreError::Backend(err.to_string())
    }
}

impl<C> std::fmt::Debug for GoogleDriveStore<C>
where
    C: google_drive3::common::Connector + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleDriveStore")
            .field("folder_id", &self.folder_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C> DocumentStore for GoogleDriveStore<C>
where
    C: google_drive3::common::Connector + Send + Sync + 'static,
{
    async fn publish(&self, path: &Path, remote_name: &str) -> Result<String, StoreError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| StoreError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        info!(remote_name, folder_id = %self.folder_id, "uploading document to drive");

        let metadata = File {
            name: Some(remote_name.to_string()),
            parents: Some(vec![self.folder_id.clone()]),
            ..File::default()
        };

        let (_, file) = self
            .hub
            .files()
            .create(metadata)
            .param("fields", "id,webViewLink")
            .supports_all_drives(true)
            .add_scope(Scope::File)
            .upload(Cursor::new(bytes), mime::APPLICATION_PDF)
            .await
            .map_err(Self::map_error)?;

        let file_id = file
            .id
            .filter(|id| !id.is_empty())
            .ok_or(StoreError::MissingField("id"))?;

        let permission = Permission {
            role: Some("reader".to_string()),
            type_: Some("anyone".to_string()),
            ..Permission::default()
        };
        self.hub
            .permissions()
            .create(permission, &file_id)
            .supports_all_drives(true)
            .add_scope(Scope::File)
            .doit()
            .await
            .map_err(Self::map_error)?;

        let link = file
            .web_view_link
            .filter(|link| !link.is_empty())
            .ok_or(StoreError::MissingField("webViewLink"))?;

        info!(remote_name, link = %link, "document shared");
        Ok(link)
    }
}
