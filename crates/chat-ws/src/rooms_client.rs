use async_trait::async_trait;
use chat_core::{ChatError, ChatErrorCategory, NewRoom, RoomInfo};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::http;

const ROOMS_PATH: &str = "api/chat/rooms";

/// Server-side room directory.
#[async_trait]
pub trait RoomsClient: Send + Sync {
    async fn list_rooms(&self) -> Result<Vec<RoomInfo>, ChatError>;

    async fn create_room(&self, room: &NewRoom) -> Result<RoomInfo, ChatError>;

    async fn room_info(&self, room_id: &str) -> Result<RoomInfo, ChatError>;
}

#[derive(Deserialize)]
struct RoomsEnvelope {
    #[serde(default)]
    rooms: Vec<RoomInfo>,
}

#[derive(Deserialize)]
struct RoomEnvelope {
    room: RoomInfo,
}

/// `GET`/`POST {api_base}/api/chat/rooms` and `GET .../rooms/{id}`.
#[derive(Debug, Clone)]
pub struct HttpRoomsClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpRoomsClient {
    pub fn new(api_base: &Url) -> Result<Self, ChatError> {
        Ok(Self {
            http: http::build_client()?,
            endpoint: http::api_endpoint(api_base, ROOMS_PATH)?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Room ids are percent-encoded as a single path segment.
    fn room_endpoint(&self, room_id: &str) -> Result<Url, ChatError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "invalid_api_base",
                    format!("{} cannot carry a room path", self.endpoint),
                )
            })?
            .push(room_id);
        Ok(url)
    }
}

#[async_trait]
impl RoomsClient for HttpRoomsClient {
    async fn list_rooms(&self) -> Result<Vec<RoomInfo>, ChatError> {
        debug!(endpoint = %self.endpoint, "listing rooms");
        let envelope: RoomsEnvelope =
            http::send_json("rooms", self.http.get(self.endpoint.clone()), None).await?;
        Ok(envelope.rooms)
    }

    async fn create_room(&self, room: &NewRoom) -> Result<RoomInfo, ChatError> {
        debug!(endpoint = %self.endpoint, name = room.name, "creating room");
        let envelope: RoomEnvelope =
            http::send_json("rooms", self.http.post(self.endpoint.clone()).json(room), None)
                .await?;
        Ok(envelope.room)
    }

    async fn room_info(&self, room_id: &str) -> Result<RoomInfo, ChatError> {
        let url = self.room_endpoint(room_id)?;
        debug!(endpoint = %url, "fetching room info");
        let resource = format!("room '{room_id}'");
        let envelope: RoomEnvelope =
            http::send_json("rooms", self.http.get(url), Some(&resource)).await?;
        Ok(envelope.room)
    }
}
