//! OCI distribution API client
//!
//! Speaks the subset of the distribution spec needed for single-layer
//! artifacts: manifest HEAD/GET/PUT, blob GET/HEAD and monolithic uploads.

use super::{CredentialProvider, Credentials, Registry, RegistryError};
use crate::artifact::IMAGE_MANIFEST_MEDIA_TYPE;
use crate::types::{Digest, Reference};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};

const DIGEST_HEADER: &str = "Docker-Content-Digest";

pub struct DistributionRegistry {
    client: Client,
    default_registry: String,
    insecure: bool,
}

impl DistributionRegistry {
    /// `default_registry` is used for references without a host
    pub fn new(default_registry: impl Into<String>, insecure: bool) -> Self {
        DistributionRegistry {
            client: Client::new(),
            default_registry: default_registry.into(),
            insecure,
        }
    }

    fn host<'a>(&'a self, reference: &'a Reference) -> &'a str {
        reference
            .registry
            .as_deref()
            .unwrap_or(&self.default_registry)
    }

    fn scheme(&self, host: &str) -> &'static str {
        if self.insecure || host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            "http"
        } else {
            "https"
        }
    }

    fn url(&self, reference: &Reference, path: &str) -> Result<Url, RegistryError> {
        let host = self.host(reference);
        let raw = format!(
            "{}://{}/v2/{}/{}",
            self.scheme(host),
            host,
            reference.repository,
            path
        );
        Url::parse(&raw).map_err(|e| RegistryError::Malformed(format!("{}: {}", raw, e)))
    }

    fn authorize(
        &self,
        request: RequestBuilder,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> RequestBuilder {
        match credentials.credentials(self.host(reference)) {
            Some(Credentials::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(Credentials::Bearer(token)) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
        what: &str,
    ) -> Result<Response, RegistryError> {
        let response = self
            .authorize(request, reference, credentials)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(what.to_string())),
            s => Err(RegistryError::Status {
                status: s.as_u16(),
                url: response.url().to_string(),
            }),
        }
    }
}

fn header_digest(response: &Response) -> Option<Digest> {
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl Registry for DistributionRegistry {
    async fn head_manifest(
        &self,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<Digest, RegistryError> {
        let url = self.url(reference, &format!("manifests/{}", reference.manifest_reference()))?;
        let request = self
            .client
            .head(url)
            .header(ACCEPT, IMAGE_MANIFEST_MEDIA_TYPE);
        let response = self
            .send(request, reference, credentials, &format!("image {}", reference))
            .await?;
        if let Some(digest) = header_digest(&response) {
            return Ok(digest);
        }
        // Some registries omit the digest header on HEAD.
        let manifest = self.get_manifest(reference, credentials).await?;
        Ok(Digest::of(&manifest))
    }

    async fn get_manifest(
        &self,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = self.url(reference, &format!("manifests/{}", reference.manifest_reference()))?;
        let request = self
            .client
            .get(url)
            .header(ACCEPT, IMAGE_MANIFEST_MEDIA_TYPE);
        let response = self
            .send(request, reference, credentials, &format!("image {}", reference))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn get_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        credentials: &dyn CredentialProvider,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = self.url(reference, &format!("blobs/{}", digest))?;
        let response = self
            .send(self.client.get(url), reference, credentials, &format!("blob {}", digest))
            .await?;
        let bytes = response.bytes().await?.to_vec();
        if !digest.verify(&bytes) {
            return Err(RegistryError::Malformed(format!("blob does not match {}", digest)));
        }
        Ok(bytes)
    }

    async fn put_blob(
        &self,
        reference: &Reference,
        bytes: &[u8],
        credentials: &dyn CredentialProvider,
    ) -> Result<Digest, RegistryError> {
        let digest = Digest::of(bytes);

        let existing = self.url(reference, &format!("blobs/{}", digest))?;
        let head = self
            .authorize(self.client.head(existing), reference, credentials)
            .send()
            .await?;
        if head.status().is_success() {
            return Ok(digest);
        }

        let start = self.url(reference, "blobs/uploads/")?;
        let response = self
            .send(self.client.post(start.clone()), reference, credentials, "upload session")
            .await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::Malformed("upload response has no Location".to_string()))?;
        let mut upload = start
            .join(location)
            .map_err(|e| RegistryError::Malformed(format!("{}: {}", location, e)))?;
        upload.query_pairs_mut().append_pair("digest", digest.as_str());

        let request = self
            .client
            .put(upload)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec());
        self.send(request, reference, credentials, "blob upload").await?;
        Ok(digest)
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        manifest: &[u8],
        credentials: &dyn CredentialProvider,
    ) -> Result<Digest, RegistryError> {
        let digest = Digest::of(manifest);
        let target = match &reference.tag {
            Some(tag) => tag.clone(),
            None => digest.to_string(),
        };
        let url = self.url(reference, &format!("manifests/{}", target))?;
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, IMAGE_MANIFEST_MEDIA_TYPE)
            .body(manifest.to_vec());
        let response = self
            .send(request, reference, credentials, &format!("image {}", reference))
            .await?;
        if let Some(reported) = header_digest(&response)
            && reported != digest
        {
            return Err(RegistryError::Malformed(format!(
                "registry stored {} but manifest hashes to {}",
                reported, digest
            )));
        }
        Ok(digest)
    }
}
