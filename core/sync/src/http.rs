//! HTTP implementation of the remote data API.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use tripsync_common::{Collection, Error, Result, Trip, TripDraft};

use crate::remote::{RemoteApi, ServerHashes};

const USER_AGENT: &str = concat!("tripsync/", env!("CARGO_PKG_VERSION"));
const HASHES_PATH: &str = "sync/hashes";

/// REST path segment of a collection.
fn collection_path(collection: Collection) -> &'static str {
    match collection {
        Collection::Trips => "trips",
        Collection::Locations => "locations",
        Collection::TripTypes => "trip-types",
        Collection::Vehicles => "vehicles",
        Collection::VehicleTypes => "vehicle-types",
    }
}

/// Remote API client over HTTP/JSON.
pub struct HttpRemoteApi {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl HttpRemoteApi {
    /// Create a client for the API rooted at `base_url`.
    ///
    /// # Errors
    /// - Invalid base URL
    /// - HTTP client construction failure
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid API URL '{}': {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base, token })
    }

    /// Absolute URL of an API path.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid endpoint '{}': {}", path, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!("GET {}", url);

        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(|e| Error::Network(format!("GET {} failed: {}", path, e)))?;

        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound(response.url().path().to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Remote {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn fetch_hashes(&self) -> Result<ServerHashes> {
        self.get_json(HASHES_PATH).await
    }

    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        self.get_json(collection_path(collection)).await
    }

    async fn create_trip(&self, draft: &TripDraft) -> Result<Trip> {
        let path = collection_path(Collection::Trips);
        let url = self.endpoint(path)?;
        debug!("POST {}", url);

        let response = self
            .authorize(self.http.post(url))
            .json(draft)
            .send()
            .await
            .map_err(|e| Error::Network(format!("POST {} failed: {}", path, e)))?;

        Self::handle_response(response).await
    }
}
