//! REST client for chat history and match/tournament snapshots

use dojo_core::{ChatMessage, Credential, Error, MatchUpdate, Result, RoomKey, TournamentUpdate};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION},
    Client, Response, StatusCode,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, instrument};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP client for the platform API.
///
/// The realtime link only carries deltas; after a reconnect the UI asks this
/// client for the authoritative state it may have missed.
pub struct RestClient {
    http: Client,
    api_base: String,
    credential: Credential,
}

impl RestClient {
    /// Create a client for `api_base` (e.g. `https://dojo.example/api/v1`)
    pub fn new(api_base: &str, credential: Credential) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::NetworkError(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            credential,
        })
    }

    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&self.credential.bearer())
            .map_err(|e| Error::AuthenticationError(format!("unusable credential: {}", e)))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    /// Check if the status indicates an authentication failure
    fn check_auth_error(status: StatusCode) -> Option<Error> {
        match status.as_u16() {
            401 => Some(Error::AuthenticationError("Credential rejected".to_string())),
            403 => Some(Error::AuthenticationError("Access forbidden".to_string())),
            _ => None,
        }
    }

    fn chat_history_url(&self, room: &RoomKey) -> String {
        format!("{}/chat/rooms/{}/messages", self.api_base, room.id)
    }

    fn match_url(&self, match_id: &str) -> String {
        format!("{}/matches/{}", self.api_base, match_id)
    }

    fn tournament_url(&self, tournament_id: &str) -> String {
        format!("{}/tournaments/{}", self.api_base, tournament_id)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        debug!("Fetching {} from: {}", what, url);

        let response: Response = self
            .http
            .get(url)
            .headers(self.default_headers()?)
            .send()
            .await?;

        debug!("{} response status: {}", what, response.status());

        if let Some(err) = Self::check_auth_error(response.status()) {
            return Err(err);
        }

        let response = response.error_for_status().map_err(|e| {
            error!("{} request failed: {}", what, e);
            Error::ApiError(e.to_string())
        })?;

        response.json().await.map_err(|e| {
            error!("Failed to parse {} response: {}", what, e);
            Error::InvalidData(e.to_string())
        })
    }

    /// Authoritative recent messages of a chat room, oldest first
    #[instrument(skip(self), fields(room = %room))]
    pub async fn fetch_chat_history(&self, room: &RoomKey) -> Result<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> = self
            .get_json(&self.chat_history_url(room), "chat history")
            .await?;
        messages.sort_by_key(|m| m.timestamp);
        debug!("Chat history fetched: {} messages", messages.len());
        Ok(messages)
    }

    /// Current state of a match
    #[instrument(skip(self))]
    pub async fn fetch_match(&self, match_id: &str) -> Result<MatchUpdate> {
        self.get_json(&self.match_url(match_id), "match").await
    }

    /// Current state of a tournament
    #[instrument(skip(self))]
    pub async fn fetch_tournament(&self, tournament_id: &str) -> Result<TournamentUpdate> {
        self.get_json(&self.tournament_url(tournament_id), "tournament")
            .await
    }
}
