//! Remote storage client
//!
//! Folder listings, metadata and quota, cache-aside in KV. Cache reads that
//! fail count as misses and cache writes that fail are only logged.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, trace, warn};

use super::errors::ApiError;
use super::fetcher::ResilientFetcher;
use super::transport::{ApiRequest, ApiResponse};
use super::types::{ApiErrorBody, FileEntry, ListFolderResponse, SpaceUsage};
use crate::kv::{Kv, KvResult};

/// Seconds a listing, metadata or quota response stays cached
pub const LISTING_TTL_SECS: u64 = 300;

const USAGE_KEY: &str = "files:usage";

/// Canonical form used for both API calls and cache keys: root is "",
/// everything else starts with '/' and has no trailing slash
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_lowercase()
    } else {
        format!("/{}", trimmed.to_lowercase())
    }
}

fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

fn list_key(path: &str) -> String {
    format!("files:list:{}", path)
}

fn meta_key(path: &str) -> String {
    format!("files:meta:{}", path)
}

#[derive(Clone)]
pub struct StorageClient {
    fetcher: ResilientFetcher,
    kv: Kv,
    api_url: String,
}

impl StorageClient {
    pub fn new(fetcher: ResilientFetcher, kv: Kv, api_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            kv,
            api_url: api_url.into(),
        }
    }

    pub fn fetcher(&self) -> &ResilientFetcher {
        &self.fetcher
    }

    fn endpoint(&self, route: &str) -> String {
        format!("{}/{}", self.api_url, route)
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.kv.get::<T>(key).await {
            Ok(Some(value)) => {
                trace!(key = key, "Cache hit");
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    async fn store<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = self.kv.set(key, value, Some(LISTING_TTL_SECS)).await {
            warn!(key = key, error = %e, "Failed to cache response");
        }
    }

    async fn post_json(&self, route: &str, body: &serde_json::Value) -> Result<ApiResponse, ApiError> {
        let request = ApiRequest::post_json(self.endpoint(route), body)?;
        self.fetcher.fetch_with_retry(request).await
    }

    /// Every entry of a folder, following pagination cursors
    pub async fn list_folder(&self, path: &str) -> Result<Vec<FileEntry>, ApiError> {
        let path = normalize_path(path);
        let key = list_key(&path);
        if let Some(entries) = self.cached::<Vec<FileEntry>>(&key).await {
            return Ok(entries);
        }

        let response = self.post_json("files/list_folder", &json!({ "path": path })).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body));
        }
        let mut page: ListFolderResponse = response.json()?;
        let mut entries = std::mem::take(&mut page.entries);

        while page.has_more {
            debug!(path = %path, fetched = entries.len(), "Fetching next listing page");
            let response = self
                .post_json("files/list_folder/continue", &json!({ "cursor": page.cursor }))
                .await?;
            if !response.is_success() {
                return Err(ApiError::from_status(response.status, &response.body));
            }
            page = response.json()?;
            entries.append(&mut page.entries);
        }

        self.store(&key, &entries).await;
        Ok(entries)
    }

    /// Metadata for one path; `None` when it does not exist
    pub async fn get_metadata(&self, path: &str) -> Result<Option<FileEntry>, ApiError> {
        let path = normalize_path(path);
        let key = meta_key(&path);
        if let Some(entry) = self.cached::<FileEntry>(&key).await {
            return Ok(Some(entry));
        }

        let response = self.post_json("files/get_metadata", &json!({ "path": path })).await?;
        match response.status {
            404 => return Ok(None),
            409 => {
                if let Ok(body) = response.json::<ApiErrorBody>() {
                    if body.is_not_found() {
                        return Ok(None);
                    }
                }
                return Err(ApiError::from_status(response.status, &response.body));
            }
            _ if !response.is_success() => {
                return Err(ApiError::from_status(response.status, &response.body));
            }
            _ => {}
        }

        let entry: FileEntry = response.json()?;
        self.store(&key, &entry).await;
        Ok(Some(entry))
    }

    /// Account storage quota
    pub async fn get_space_usage(&self) -> Result<SpaceUsage, ApiError> {
        if let Some(usage) = self.cached::<SpaceUsage>(USAGE_KEY).await {
            return Ok(usage);
        }

        let request = ApiRequest::post(self.endpoint("users/get_space_usage"));
        let response = self.fetcher.fetch_with_retry(request).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body));
        }

        let usage: SpaceUsage = response.json()?;
        self.store(USAGE_KEY, &usage).await;
        Ok(usage)
    }

    /// Drop cached data touched by a change at `path`: its own listing and
    /// metadata, plus its parent's listing
    pub async fn invalidate_path(&self, path: &str) -> KvResult<u64> {
        let path = normalize_path(path);
        let list = list_key(&path);
        let meta = meta_key(&path);
        let parent = list_key(&parent_path(&path));
        let removed = self.kv.del(&[&list, &meta, &parent, USAGE_KEY]).await?;
        debug!(path = %path, removed = removed, "Invalidated cached path");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::token::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
    use crate::api::TokenManager;
    use crate::testing::MockTransport;
    use std::sync::Arc;

    const API: &str = "https://api.example/2";
    const TOKEN_URL: &str = "https://auth.example/oauth2/token";

    async fn client(transport: &Arc<MockTransport>) -> (StorageClient, Kv) {
        let kv = Kv::in_memory();
        kv.set(REFRESH_TOKEN_KEY, "long-lived", None).await.unwrap();
        kv.set(ACCESS_TOKEN_KEY, "token", Some(3600)).await.unwrap();
        let tokens = TokenManager::new(kv.clone(), transport.clone(), TOKEN_URL, "", "");
        let fetcher = ResilientFetcher::new(transport.clone(), tokens);
        (StorageClient::new(fetcher, kv.clone(), API), kv)
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/"), "");
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("Docs/"), "/docs");
        assert_eq!(normalize_path("/Docs/Reports"), "/docs/reports");
        assert_eq!(parent_path("/docs/reports"), "/docs");
        assert_eq!(parent_path("/docs"), "");
    }

    #[tokio::test]
    async fn test_list_folder_follows_cursor_and_caches() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            &format!("{API}/files/list_folder"),
            200,
            r#"{"entries": [{".tag": "file", "name": "a.txt", "size": 10}], "cursor": "c1", "has_more": true}"#,
        );
        transport.respond(
            &format!("{API}/files/list_folder/continue"),
            200,
            r#"{"entries": [{".tag": "folder", "name": "sub"}], "cursor": "c2", "has_more": false}"#,
        );
        let (client, _kv) = client(&transport).await;

        let entries = client.list_folder("/Docs").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].is_folder());

        let continued = transport.requests_to(&format!("{API}/files/list_folder/continue"));
        assert!(continued[0].body.as_deref().unwrap().contains("\"c1\""));

        // served from KV, the mock has nothing left to replay
        let cached = client.list_folder("/docs/").await.unwrap();
        assert_eq!(cached, entries);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_not_found_is_none() {
        let transport = Arc::new(MockTransport::new());
        let url = format!("{API}/files/get_metadata");
        transport.respond(&url, 409, r#"{"error_summary": "path/not_found/...", "error": {".tag": "path"}}"#);
        transport.respond(&url, 404, "");
        transport.respond(&url, 409, r#"{"error_summary": "path/malformed_path/..."}"#);
        let (client, _kv) = client(&transport).await;

        assert_eq!(client.get_metadata("/missing").await.unwrap(), None);
        assert_eq!(client.get_metadata("/missing").await.unwrap(), None);
        let err = client.get_metadata("/bad").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_invalidate_path_drops_listing() {
        let transport = Arc::new(MockTransport::new());
        let url = format!("{API}/users/get_space_usage");
        transport.respond(&url, 200, r#"{"used": 1, "allocation": {".tag": "individual", "allocated": 10}}"#);
        let (client, kv) = client(&transport).await;

        kv.set(&list_key("/docs"), &Vec::<FileEntry>::new(), Some(60)).await.unwrap();
        kv.set(&list_key(""), &Vec::<FileEntry>::new(), Some(60)).await.unwrap();
        assert_eq!(client.get_space_usage().await.unwrap().used, 1);

        let removed = client.invalidate_path("/Docs").await.unwrap();
        assert_eq!(removed, 3);
        assert!(!kv.exists(&list_key("/docs")).await.unwrap());
        assert!(!kv.exists(&list_key("")).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_read_failure_is_a_miss() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            &format!("{API}/files/list_folder"),
            200,
            r#"{"entries": [], "cursor": "c", "has_more": false}"#,
        );
        let (client, kv) = client(&transport).await;
        kv.sadd(&list_key("/docs"), &["wrong-type"]).await.unwrap();

        let entries = client.list_folder("/docs").await.unwrap();
        assert!(entries.is_empty());
    }
}
