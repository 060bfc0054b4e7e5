// Public AT Protocol client: unauthenticated XRPC over HTTP.
//
// Every endpoint tidemark reads (graph listings, profiles, author feeds,
// quotes, repo export) is public. Mute lists and notifications need a
// session and are not reachable from here.

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Default public API endpoint for AT Protocol read operations.
pub const DEFAULT_PUBLIC_API_URL: &str = "https://public.api.bsky.app";

const PLC_DIRECTORY_URL: &str = "https://plc.directory";

/// Error body an XRPC endpoint returns with a non-2xx status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct XrpcErrorBody {
    #[serde(skip)]
    pub status: u16,
    pub error: Option<String>,
    pub message: Option<String>,
}

/// Unauthenticated HTTP client for public AT Protocol XRPC endpoints.
pub struct PublicAtpClient {
    client: reqwest::Client,
    base_url: String,
}

impl PublicAtpClient {
    /// Create a client pointing at the given base URL: the public AppView
    /// for reads, or a PDS for `com.atproto.repo.*` and `com.atproto.sync.*`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tidemark/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, nsid: &str, params: &[(&str, &str)]) -> Result<reqwest::Response> {
        let url = format!("{}/xrpc/{}", self.base_url, nsid);
        debug!(nsid = nsid, "XRPC GET request");

        self.client
            .get(&url)
            .query(params)
            .send()
            .await
            .with_context(|| format!("XRPC request failed: {nsid}"))
    }

    /// Make a GET request to an XRPC endpoint and deserialize the response.
    pub async fn xrpc_get<T: DeserializeOwned>(&self, nsid: &str, params: &[(&str, &str)]) -> Result<T> {
        match self.xrpc_get_or_error(nsid, params).await? {
            Ok(value) => Ok(value),
            Err(body) => anyhow::bail!(
                "XRPC {nsid} returned {}: {}",
                body.status,
                body.message.or(body.error).unwrap_or_default()
            ),
        }
    }

    /// Like `xrpc_get`, but a well-formed error response is returned as
    /// `Ok(Err(body))` so callers can branch on the XRPC error name.
    pub async fn xrpc_get_or_error<T: DeserializeOwned>(
        &self,
        nsid: &str,
        params: &[(&str, &str)],
    ) -> Result<std::result::Result<T, XrpcErrorBody>> {
        let response = self.send(nsid, params).await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let mut body: XrpcErrorBody = serde_json::from_str(&text).unwrap_or_else(|_| XrpcErrorBody {
                message: Some(text),
                ..Default::default()
            });
            body.status = status.as_u16();
            return Ok(Err(body));
        }

        let value = response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to deserialize {nsid} response"))?;
        Ok(Ok(value))
    }

    /// Stream a binary XRPC response to `dest`. Returns bytes written.
    pub async fn xrpc_download(&self, nsid: &str, params: &[(&str, &str)], dest: &Path) -> Result<u64> {
        let mut response = self.send(nsid, params).await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("XRPC {nsid} returned {status}: {body}");
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Download interrupted: {nsid}"))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Resolve a handle to its DID via the public API.
    pub async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let resp: ResolveHandleResponse = self
            .xrpc_get("com.atproto.identity.resolveHandle", &[("handle", handle)])
            .await
            .with_context(|| format!("Failed to resolve handle @{handle}"))?;
        Ok(resp.did)
    }

    /// Look up the PDS hosting a DID's repo via the PLC directory.
    pub async fn resolve_pds_url(&self, did: &str) -> Result<String> {
        let url = format!("{PLC_DIRECTORY_URL}/{did}");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch DID document for {did}"))?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("PLC directory returned {status} for {did}");
        }

        let doc: DidDocument = response.json().await.context("Failed to parse DID document")?;
        pds_endpoint(&doc).ok_or_else(|| anyhow::anyhow!("No PDS service found in DID document for {did}"))
    }

    /// Download the full repository export for `did` into `dest`.
    pub async fn download_repo(&self, did: &str, dest: &Path) -> Result<u64> {
        self.xrpc_download("com.atproto.sync.getRepo", &[("did", did)], dest)
            .await
            .with_context(|| format!("Failed to download repo for {did}"))
    }
}

fn pds_endpoint(doc: &DidDocument) -> Option<String> {
    doc.service
        .iter()
        .find(|s| s.id == "#atproto_pds")
        .map(|s| s.service_endpoint.clone())
}

// -- Serde types for identity resolution --

#[derive(Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Deserialize)]
struct DidDocument {
    service: Vec<DidService>,
}

#[derive(Deserialize)]
struct DidService {
    id: String,
    #[serde(rename = "serviceEndpoint")]
    service_endpoint: String,
}

// -- Serde types for com.atproto.repo.listRecords --

#[derive(Debug, Deserialize)]
pub struct ListRecordsResponse {
    pub records: Vec<RepoRecord>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RepoRecord {
    pub uri: String,
    pub value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = PublicAtpClient::new("https://example.com/").unwrap();
        assert_eq!(client.base_url(), "https://example.com");
    }

    #[test]
    fn test_pds_endpoint_from_did_document() {
        let doc: DidDocument = serde_json::from_str(
            r##"{"service":[
                {"id":"#bsky_fg","serviceEndpoint":"https://feed.example"},
                {"id":"#atproto_pds","serviceEndpoint":"https://pds.example"}
            ]}"##,
        )
        .unwrap();
        assert_eq!(pds_endpoint(&doc).as_deref(), Some("https://pds.example"));
    }

    #[test]
    fn test_error_body_parses() {
        let body: XrpcErrorBody =
            serde_json::from_str(r#"{"error":"AccountTakedown","message":"Account has been suspended"}"#).unwrap();
        assert_eq!(body.error.as_deref(), Some("AccountTakedown"));
        assert_eq!(body.status, 0);
    }
}
