//! Content-addressed uploads to the artifact store.
//!
//! An upload hashes the body with md5 first and skips the actual put when
//! the store already holds an object with the same etag and content type, so
//! repeated syncs of unchanged files are free.

use std::path::Path;

use md5::{Digest, Md5};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::provider::ObjectStore;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A stored artifact, as exposed to template rendering through the `File`
/// context map.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteFile {
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "VersionID")]
    pub version_id: Option<String>,
    /// md5 of the content in hex representation.
    #[serde(rename = "Hash")]
    pub hash: String,
    #[serde(rename = "ContentType")]
    pub content_type: String,
    #[serde(rename = "Region")]
    pub region: String,
    /// Public https URL of the object, including the version when known.
    #[serde(rename = "URL")]
    pub url: String,
}

impl RemoteFile {
    fn set_url(&mut self) {
        if self.region.is_empty() {
            return;
        }
        self.url =
            format!("https://s3.{}.amazonaws.com/{}/{}", self.region, self.bucket, self.key);
        if let Some(version_id) = &self.version_id {
            self.url.push_str("?versionId=");
            self.url.push_str(&escape_query_value(version_id));
        }
    }
}

/// Input for [`upload`].
#[derive(Debug, Clone)]
pub struct Upload<'a> {
    pub bucket: &'a str,
    /// Explicit object key; defaults to the basename of `source`.
    pub key: Option<&'a str>,
    /// Prefix prepended to the key.
    pub prefix: &'a str,
    /// Local file to upload.
    pub source: &'a Path,
    pub content_type: Option<&'a str>,
    pub region: &'a str,
}

impl Default for Upload<'_> {
    fn default() -> Self {
        Self {
            bucket: "",
            key: None,
            prefix: "",
            source: Path::new(""),
            content_type: None,
            region: "",
        }
    }
}

/// Upload a local file, skipping the put when the stored object already has
/// the same md5 etag and content type.
pub async fn upload(store: &dyn ObjectStore, config: Upload<'_>) -> Result<RemoteFile> {
    if config.bucket.is_empty() {
        return Err(Error::config("bucket is not set"));
    }

    let mut file = RemoteFile {
        bucket: config.bucket.to_string(),
        key: object_key(&config)?,
        content_type: config.content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
        region: config.region.to_string(),
        ..Default::default()
    };

    let body = tokio::fs::read(config.source)
        .await
        .map_err(|e| Error::io(config.source, &e))?;
    file.hash = format!("{:x}", Md5::digest(&body));

    if let Some(existing) = store.head(&file.bucket, &file.key).await? {
        if existing.content_type == file.content_type
            && existing.etag.trim_matches('"') == file.hash
        {
            file.version_id = existing.version_id;
            file.set_url();
            return Ok(file);
        }
    }

    let meta = store.put(&file.bucket, &file.key, &body, &file.content_type).await?;
    file.version_id = meta.version_id;
    file.set_url();
    Ok(file)
}

fn object_key(config: &Upload<'_>) -> Result<String> {
    let mut key = config.prefix.to_string();
    match config.key {
        Some(explicit) if !explicit.is_empty() => key.push_str(explicit),
        _ => {
            let base = config
                .source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::config("neither key nor source file name are set"))?;
            key.push_str(base);
        }
    }
    Ok(key)
}

fn escape_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
