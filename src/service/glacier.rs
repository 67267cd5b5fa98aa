//! Amazon Glacier REST client (multipart upload with explicit tree hashes)

use chrono::Utc;
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::Deserialize;

use super::aws::{self, classify_transport, send, uri_encode, Credentials, SigV4, EMPTY_PAYLOAD_SHA256};
use super::{ArchiveService, PartBody, PartReceipt};
use crate::checksum::{PartDigest, TreeHash};
use crate::error::ServiceError;
use crate::plan::ChunkDescriptor;

const API_VERSION: &str = "2012-06-01";

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListVaultsResponse {
    #[serde(default)]
    vault_list: Vec<VaultDescription>,
    marker: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VaultDescription {
    vault_name: String,
}

pub struct GlacierClient {
    http: Client,
    signer: SigV4,
    host: String,
    vault: String,
}

impl GlacierClient {
    pub fn new(region: &str, vault: &str, creds: Credentials) -> Result<Self, ServiceError> {
        Ok(Self {
            http: aws::http_client()?,
            signer: SigV4::new(creds, region, "glacier"),
            host: format!("glacier.{region}.amazonaws.com"),
            vault: vault.to_string(),
        })
    }

    fn vault_path(&self, name: &str) -> String {
        format!("/-/vaults/{}", uri_encode(name))
    }

    fn upload_path(&self, upload_id: &str) -> String {
        format!(
            "{}/multipart-uploads/{}",
            self.vault_path(&self.vault),
            uri_encode(upload_id)
        )
    }

    /// Build a signed request. `path` is already encoded once.
    fn request(
        &self,
        method: Method,
        path: &str,
        query: &str,
        mut headers: Vec<(String, String)>,
        payload_sha256: &str,
    ) -> RequestBuilder {
        headers.push(("x-amz-glacier-version".into(), API_VERSION.into()));
        headers.push(("x-amz-content-sha256".into(), payload_sha256.into()));
        // Canonical URI segments are encoded a second time for non-S3 services
        let canonical_path = path.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let auth = self.signer.sign(
            method.as_str(),
            &self.host,
            &canonical_path,
            query,
            &mut headers,
            payload_sha256,
            Utc::now(),
        );

        let url = if query.is_empty() {
            format!("https://{}{}", self.host, path)
        } else {
            format!("https://{}{}?{}", self.host, path, query)
        };
        let mut req = self.http.request(method, url);
        for (k, v) in &headers {
            // reqwest derives Host from the URL
            if k != "host" {
                req = req.header(k.as_str(), v.as_str());
            }
        }
        req.header("Authorization", auth)
    }

    fn response_header(resp: &Response, name: &str) -> Result<String, ServiceError> {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Protocol(format!("response without {name} header")))
    }
}

impl ArchiveService for GlacierClient {
    fn vault(&self) -> &str {
        &self.vault
    }

    fn list_vaults(&self) -> Result<Vec<String>, ServiceError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let query = marker
                .as_ref()
                .map(|m| format!("marker={}", uri_encode(m)))
                .unwrap_or_default();
            let req = self.request(Method::GET, "/-/vaults", &query, Vec::new(), EMPTY_PAYLOAD_SHA256);
            let page: ListVaultsResponse = send("list vaults", req)?
                .json()
                .map_err(|e| classify_transport("list vaults", e))?;
            names.extend(page.vault_list.into_iter().map(|v| v.vault_name));
            match page.marker {
                Some(m) if !m.is_empty() => marker = Some(m),
                _ => break,
            }
        }
        Ok(names)
    }

    fn create_vault(&self, name: &str) -> Result<(), ServiceError> {
        let req = self.request(
            Method::PUT,
            &self.vault_path(name),
            "",
            Vec::new(),
            EMPTY_PAYLOAD_SHA256,
        );
        send("create vault", req)?;
        Ok(())
    }

    fn initiate_multipart_upload(
        &self,
        part_size: u32,
        description: &str,
    ) -> Result<String, ServiceError> {
        let path = format!("{}/multipart-uploads", self.vault_path(&self.vault));
        let headers = vec![
            ("x-amz-part-size".to_string(), part_size.to_string()),
            (
                "x-amz-archive-description".to_string(),
                description.to_string(),
            ),
        ];
        let req = self.request(Method::POST, &path, "", headers, EMPTY_PAYLOAD_SHA256);
        let resp = send("initiate multipart upload", req)?;
        Self::response_header(&resp, "x-amz-multipart-upload-id")
    }

    fn upload_part(
        &self,
        upload_id: &str,
        chunk: &ChunkDescriptor,
        digest: &PartDigest,
        body: PartBody,
    ) -> Result<PartReceipt, ServiceError> {
        let headers = vec![
            ("Content-Range".to_string(), chunk.content_range()),
            ("x-amz-sha256-tree-hash".to_string(), digest.tree.to_hex()),
        ];
        // Streamed from the file handle with a fixed Content-Length
        let req = self
            .request(
                Method::PUT,
                &self.upload_path(upload_id),
                "",
                headers,
                &digest.linear_hex(),
            )
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::sized(body, u64::from(chunk.length)));
        let resp = send("upload part", req)?;
        let echoed = Self::response_header(&resp, "x-amz-sha256-tree-hash")
            .unwrap_or_else(|_| digest.tree.to_hex());
        Ok(PartReceipt(echoed))
    }

    fn complete_multipart_upload(
        &self,
        upload_id: &str,
        archive_size: u64,
        checksum: &TreeHash,
    ) -> Result<String, ServiceError> {
        let headers = vec![
            ("x-amz-archive-size".to_string(), archive_size.to_string()),
            ("x-amz-sha256-tree-hash".to_string(), checksum.to_hex()),
        ];
        let req = self.request(
            Method::POST,
            &self.upload_path(upload_id),
            "",
            headers,
            EMPTY_PAYLOAD_SHA256,
        );
        let resp = send("complete multipart upload", req)?;
        Self::response_header(&resp, "x-amz-archive-id")
    }

    fn delete_archive(&self, archive_id: &str) -> Result<(), ServiceError> {
        let path = format!(
            "{}/archives/{}",
            self.vault_path(&self.vault),
            uri_encode(archive_id)
        );
        let req = self.request(Method::DELETE, &path, "", Vec::new(), EMPTY_PAYLOAD_SHA256);
        send("delete archive", req)?;
        Ok(())
    }
}
