//! Remote cache tier over a pluggable transport.
//!
//! Network failures never abort the surrounding build: every operation
//! logs and degrades to `None` or `false`.

use crate::{
    error::{CacheError, Result},
    model::{ArtifactDescriptor, BuildRecord, BuildSource, CacheContext, ModuleId},
    utils,
};
use std::{env, fs, io::Write, path::Path};
use url::Url;

/// Environment variables overriding configured remote credentials.
pub const ENV_USERNAME: &str = "BUILD_CACHE_USERNAME";
pub const ENV_PASSWORD: &str = "BUILD_CACHE_PASSWORD";

const LAYOUT_VERSION: &str = "v1";
const BUILDINFO_XML: &str = "buildinfo.xml";

/// Wire-level access to the remote endpoint.
pub trait RemoteTransport: Send + Sync {
    /// Fetches a resource, `None` when it does not exist. `range_start`
    /// requests the byte suffix from servers supporting range gets.
    fn get(&self, resource: &str, range_start: Option<u64>) -> Result<Option<Vec<u8>>>;

    /// Stores a resource; `false` when the server refused it.
    fn put(&self, resource: &str, body: &[u8]) -> Result<bool>;
}

/// Blocking HTTP implementation of [`RemoteTransport`].
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    base: Url,
    credentials: Option<(String, String)>,
}

impl HttpTransport {
    /// Credentials resolve by priority: environment variables, then the
    /// configured server credentials.
    pub fn new(base: Url, configured_credentials: Option<(String, String)>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|err| CacheError::config(format!("remote client: {err}")))?;
        let credentials = match (env::var(ENV_USERNAME), env::var(ENV_PASSWORD)) {
            (Ok(user), Ok(password)) => Some((user, password)),
            _ => configured_credentials,
        };
        Ok(Self { client, base, credentials })
    }

    fn url(&self, resource: &str) -> Result<Url> {
        self.base
            .join(resource)
            .map_err(|err| CacheError::config(format!("remote resource {resource}: {err}")))
    }

    fn authorized(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }
}

impl RemoteTransport for HttpTransport {
    fn get(&self, resource: &str, range_start: Option<u64>) -> Result<Option<Vec<u8>>> {
        let url = self.url(resource)?;
        let mut request = self.authorized(self.client.get(url));
        if let Some(start) = range_start {
            request = request.header(reqwest::header::RANGE, format!("bytes={start}-"));
        }
        let response =
            request.send().map_err(|err| CacheError::msg(format!("GET {resource}: {err}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CacheError::msg(format!("GET {resource}: HTTP {}", response.status())));
        }
        let bytes =
            response.bytes().map_err(|err| CacheError::msg(format!("GET {resource}: {err}")))?;
        Ok(Some(bytes.to_vec()))
    }

    fn put(&self, resource: &str, body: &[u8]) -> Result<bool> {
        let url = self.url(resource)?;
        let response = self
            .authorized(self.client.put(url))
            .body(body.to_vec())
            .send()
            .map_err(|err| CacheError::msg(format!("PUT {resource}: {err}")))?;
        Ok(response.status().is_success())
    }
}

/// The remote cache tier.
pub struct RemoteRepository {
    transport: Box<dyn RemoteTransport>,
    server_id: String,
    save_enabled: bool,
}

impl RemoteRepository {
    pub fn new(
        transport: Box<dyn RemoteTransport>,
        server_id: impl Into<String>,
        save_enabled: bool,
    ) -> Self {
        Self { transport, server_id: server_id.into(), save_enabled }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn save_enabled(&self) -> bool {
        self.save_enabled
    }

    fn record_resource(ctx: &CacheContext) -> String {
        format!(
            "{LAYOUT_VERSION}/{}/{}/{}/{BUILDINFO_XML}",
            ctx.module.group_id,
            ctx.module.artifact_id,
            ctx.checksum()
        )
    }

    fn artifact_resource(ctx: &CacheContext, file_name: &str) -> String {
        format!(
            "{LAYOUT_VERSION}/{}/{}/{}/{file_name}",
            ctx.module.group_id,
            ctx.module.artifact_id,
            ctx.checksum()
        )
    }

    /// Fetches and parses the build record for the fingerprint.
    pub fn find_build(&self, ctx: &CacheContext) -> Option<BuildRecord> {
        let resource = Self::record_resource(ctx);
        match self.transport.get(&resource, None) {
            Ok(Some(bytes)) => parse_record(&bytes, &resource),
            Ok(None) => {
                debug!(module = %ctx.module, "no remote record");
                None
            }
            Err(err) => {
                warn!(module = %ctx.module, %err, "remote lookup failed");
                None
            }
        }
    }

    /// The most recent record published for the module, regardless of
    /// fingerprint. Used for baseline diffing.
    pub fn find_baseline(&self, module: &ModuleId) -> Option<BuildRecord> {
        let resource =
            format!("{LAYOUT_VERSION}/{}/{}/{BUILDINFO_XML}", module.group_id, module.artifact_id);
        match self.transport.get(&resource, None) {
            Ok(Some(bytes)) => parse_record(&bytes, &resource),
            Ok(None) => None,
            Err(err) => {
                warn!(module = %module, %err, "baseline lookup failed");
                None
            }
        }
    }

    /// Publishes the record; `false` on any failure.
    pub fn put_build(&self, ctx: &CacheContext, record: &BuildRecord) -> bool {
        let xml = match utils::to_xml_string(record) {
            Ok(xml) => xml,
            Err(err) => {
                warn!(module = %ctx.module, %err, "failed to serialize record for push");
                return false;
            }
        };
        self.try_put(&Self::record_resource(ctx), xml.as_bytes())
    }

    /// Downloads an artifact blob into `dst`, resuming a partial file via
    /// a range get when possible.
    pub fn fetch_artifact(
        &self,
        ctx: &CacheContext,
        descriptor: &ArtifactDescriptor,
        dst: &Path,
    ) -> bool {
        let resource = Self::artifact_resource(ctx, &descriptor.file_name);
        let existing = fs::metadata(dst).map(|m| m.len()).unwrap_or(0);
        if existing == descriptor.file_size && descriptor.file_size > 0 {
            return true;
        }
        let range_start = (existing > 0 && existing < descriptor.file_size).then_some(existing);

        match self.transport.get(&resource, range_start) {
            Ok(Some(bytes)) => {
                let result = if range_start.is_some() {
                    fs::OpenOptions::new()
                        .append(true)
                        .open(dst)
                        .and_then(|mut file| file.write_all(&bytes))
                        .map_err(|err| CacheError::io(err, dst))
                } else {
                    utils::write_file_atomic(&bytes, dst)
                };
                match result {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(blob = %descriptor.file_name, %err, "failed to store fetched blob");
                        false
                    }
                }
            }
            Ok(None) => {
                debug!(blob = %descriptor.file_name, "remote blob not found");
                false
            }
            Err(err) => {
                warn!(blob = %descriptor.file_name, %err, "blob fetch failed");
                false
            }
        }
    }

    /// Uploads an artifact blob; `false` on any failure.
    pub fn put_artifact(&self, ctx: &CacheContext, file_name: &str, src: &Path) -> bool {
        let bytes = match fs::read(src) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(blob = file_name, %err, "failed to read blob for push");
                return false;
            }
        };
        self.try_put(&Self::artifact_resource(ctx, file_name), &bytes)
    }

    /// Uploads a report document under the session-scoped reports prefix.
    pub fn put_report(&self, file_name: &str, content: &[u8]) -> bool {
        self.try_put(&format!("{LAYOUT_VERSION}/reports/{file_name}"), content)
    }

    fn try_put(&self, resource: &str, body: &[u8]) -> bool {
        match self.transport.put(resource, body) {
            Ok(accepted) => {
                if !accepted {
                    warn!(resource, "remote refused upload");
                }
                accepted
            }
            Err(err) => {
                warn!(resource, %err, "upload failed");
                false
            }
        }
    }
}

fn parse_record(bytes: &[u8], resource: &str) -> Option<BuildRecord> {
    let text = std::str::from_utf8(bytes).ok()?;
    match utils::from_xml_str::<BuildRecord>(text) {
        Ok(mut record) => {
            record.source = BuildSource::Remote;
            Some(record)
        }
        Err(err) => {
            warn!(resource, %err, "corrupt remote record");
            None
        }
    }
}
