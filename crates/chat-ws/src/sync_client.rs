use async_trait::async_trait;
use chat_core::{ChatError, SyncRequest, SyncResponse};
use tracing::debug;
use url::Url;

use crate::http;

const SYNC_PATH: &str = "api/chat/sync";

/// Fetches message batches newer than a cursor.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn fetch(&self, request: &SyncRequest) -> Result<SyncResponse, ChatError>;
}

/// `POST {api_base}/api/chat/sync` with a JSON body.
#[derive(Debug, Clone)]
pub struct HttpSyncClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpSyncClient {
    pub fn new(api_base: &Url) -> Result<Self, ChatError> {
        Ok(Self {
            http: http::build_client()?,
            endpoint: http::api_endpoint(api_base, SYNC_PATH)?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn fetch(&self, request: &SyncRequest) -> Result<SyncResponse, ChatError> {
        debug!(
            endpoint = %self.endpoint,
            rooms = request.rooms.len(),
            last_sync = request.last_sync.as_millis(),
            "requesting sync batch"
        );
        http::send_json("sync", self.http.post(self.endpoint.clone()).json(request), None).await
    }
}
