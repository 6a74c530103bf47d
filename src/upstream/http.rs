use std::fmt;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use moka::future::Cache;
use tracing::{debug, instrument, warn};

use crate::config::{RemoteConfig, ResolveConfig, TransportConfig};
use crate::error::ResolveError;
use crate::request::{AuthMode, RequestContext};
use crate::storage::ArtifactStream;
use crate::upstream::Upstream;

// ---------------------------------------------------------------------------
// Client construction
// ---------------------------------------------------------------------------

/// Plain HTTP access to one upstream registry.
///
/// Carries its own connection pool configured from the remote's transport
/// section, and a capacity-bounded probe cache so request bursts for the
/// same artifact do not hammer the upstream with existence checks.
pub struct HttpUpstream {
    name: String,
    root: String,
    client: reqwest::Client,
    /// Header names (lowercased) this remote accepts credentials under.
    auth_headers: Vec<String>,
    /// (path, token) -> resolved URI.  Successful probes only; entries live
    /// until capacity eviction.
    probe_cache: Cache<(String, String), String>,
}

impl HttpUpstream {
    pub fn new(remote: &RemoteConfig, resolve: &ResolveConfig) -> Result<Self> {
        let client = build_client(&remote.transport)
            .with_context(|| format!("remote {}: failed to build HTTP client", remote.name))?;
        Ok(Self {
            name: remote.name.clone(),
            root: remote.uri.trim_end_matches('/').to_string(),
            client,
            auth_headers: remote
                .security
                .auth_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            probe_cache: Cache::builder()
                .max_capacity(resolve.probe_cache_capacity)
                .build(),
        })
    }

    /// Absolute pass-through for paths that already are full URLs, root-join
    /// for everything else.
    fn target_url(&self, path: &str) -> String {
        if is_absolute_url(path) {
            path.to_string()
        } else {
            format!("{}/{}", self.root, path.trim_start_matches('/'))
        }
    }

    fn recognises_header(&self, header: &str) -> bool {
        let header = header.to_ascii_lowercase();
        self.auth_headers.iter().any(|h| *h == header)
    }

    fn apply_auth(
        &self,
        req: reqwest::RequestBuilder,
        ctx: &RequestContext,
    ) -> reqwest::RequestBuilder {
        match ctx.auth_mode {
            AuthMode::None => req,
            AuthMode::Bearer => req.bearer_auth(&ctx.token),
            AuthMode::Header => {
                if self.recognises_header(&ctx.header) {
                    req.header(&ctx.header, &ctx.token)
                } else {
                    debug!(remote = %self.name, header = %ctx.header, "credential header not recognised; sending unauthenticated");
                    req
                }
            }
        }
    }

    /// Send a request racing the caller's cancellation token.  Transport
    /// failures are reported distinctly from upstream status codes.
    async fn execute(
        &self,
        req: reqwest::RequestBuilder,
        ctx: &RequestContext,
    ) -> Result<reqwest::Response, ResolveError> {
        tokio::select! {
            () = ctx.cancel.cancelled() => Err(ResolveError::Canceled),
            result = req.send() => result.map_err(|e| ResolveError::Unreachable(e.to_string())),
        }
    }
}

impl fmt::Display for HttpUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
    /// Probes with a GET whose body is dropped immediately, so the observed
    /// status matches what a download of the same path would get even on
    /// upstreams that mishandle HEAD.
    #[instrument(skip(self, ctx), fields(remote = %self.name))]
    async fn exists(&self, path: &str, ctx: &RequestContext) -> Result<String, ResolveError> {
        let cache_key = (path.to_string(), ctx.token.clone());
        if let Some(uri) = self.probe_cache.get(&cache_key).await {
            debug!("probe served from cache");
            return Ok(uri);
        }

        let url = self.target_url(path);
        let req = self.apply_auth(self.client.get(&url), ctx);
        let resp = self.execute(req, ctx).await?;

        let status = resp.status();
        if status.is_success() {
            drop(resp);
            self.probe_cache.insert(cache_key, url.clone()).await;
            Ok(url)
        } else {
            Err(ResolveError::UpstreamStatus(status.as_u16()))
        }
    }

    #[instrument(skip(self, ctx), fields(remote = %self.name))]
    async fn download(&self, path: &str, ctx: &RequestContext)
        -> Result<ArtifactStream, ResolveError> {
        let url = self.target_url(path);
        let req = self.apply_auth(self.client.get(&url), ctx);
        let resp = self.execute(req, ctx).await?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%url, %status, "upstream download refused");
            return Err(ResolveError::UpstreamStatus(status.as_u16()));
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_absolute_url(path: &str) -> bool {
    reqwest::Url::parse(path)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Build a reqwest client honouring the remote's transport section: extra
/// root CA, client identity, outbound proxy, certificate-check bypass, and
/// the idle-connection bound.
fn build_client(transport: &TransportConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent("pkgcache/0.1");

    if let Some(max_idle) = transport.max_idle_per_host {
        builder = builder.pool_max_idle_per_host(max_idle);
    }

    if transport.skip_tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(ref ca_file) = transport.ca_file {
        let pem = std::fs::read(ca_file)
            .with_context(|| format!("failed to read CA file: {ca_file}"))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("invalid CA certificate: {ca_file}"))?;
        builder = builder.add_root_certificate(cert);
    }

    if let (Some(cert_file), Some(key_file)) =
        (&transport.client_cert_file, &transport.client_key_file)
    {
        let mut pem = std::fs::read(cert_file)
            .with_context(|| format!("failed to read client cert: {cert_file}"))?;
        pem.extend(
            std::fs::read(key_file)
                .with_context(|| format!("failed to read client key: {key_file}"))?,
        );
        let identity = reqwest::Identity::from_pem(&pem)
            .context("invalid client certificate/key pair")?;
        builder = builder.identity(identity);
    }

    if let Some(ref proxy_url) = transport.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .with_context(|| format!("invalid proxy url: {proxy_url}"))?;
        builder = builder.proxy(proxy);
    }

    builder.build().context("failed to build reqwest client")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
