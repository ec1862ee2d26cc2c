use std::{fmt, path::PathBuf};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Result, WavtapError};

/// Encoded audio asset handed to [`crate::PlaybackSession::load_file`].
pub enum AudioSource {
    /// A locator: `file://` URL, filesystem path, or `http(s)://` URL when the
    /// `http` feature is enabled.
    Url(String),
    /// Encoded bytes already in memory.
    Bytes(Bytes),
    /// An opaque binary stream read to its end.
    Blob(Box<dyn AsyncRead + Send + Unpin>),
}

impl AudioSource {
    pub fn url(locator: impl Into<String>) -> Self {
        Self::Url(locator.into())
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::Bytes(bytes.into())
    }

    pub fn blob(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Blob(Box::new(reader))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Url(_) => "url",
            Self::Bytes(_) => "bytes",
            Self::Blob(_) => "blob",
        }
    }

    /// Resolves the source to its raw encoded bytes.
    pub async fn into_bytes(self) -> Result<Bytes> {
        let bytes = match self {
            Self::Url(locator) => fetch(&locator).await?,
            Self::Bytes(bytes) => bytes,
            Self::Blob(mut reader) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data).await?;
                Bytes::from(data)
            }
        };

        if bytes.is_empty() {
            return Err(WavtapError::invalid_input("audio source contains no bytes"));
        }
        Ok(bytes)
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(locator) => f.debug_tuple("Url").field(locator).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Blob(_) => f.write_str("Blob(..)"),
        }
    }
}

impl From<&str> for AudioSource {
    fn from(value: &str) -> Self {
        Self::url(value)
    }
}

impl From<String> for AudioSource {
    fn from(value: String) -> Self {
        Self::Url(value)
    }
}

impl From<PathBuf> for AudioSource {
    fn from(value: PathBuf) -> Self {
        Self::Url(value.to_string_lossy().into_owned())
    }
}

impl From<Vec<u8>> for AudioSource {
    fn from(value: Vec<u8>) -> Self {
        Self::bytes(value)
    }
}

impl From<Bytes> for AudioSource {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

/// Accepts a JSON string as a locator and an array of octets as a byte
/// buffer. Every other shape is rejected.
impl TryFrom<serde_json::Value> for AudioSource {
    type Error = WavtapError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        match value {
            Value::String(locator) => Ok(Self::Url(locator)),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|octet| u8::try_from(octet).ok())
                        .ok_or_else(|| {
                            WavtapError::invalid_input("byte buffer entries must be integers in 0..=255")
                        })
                })
                .collect::<Result<Vec<u8>>>()
                .map(Self::from),
            other => Err(WavtapError::invalid_input(format!(
                "audio source must be a URL string, byte buffer, or blob, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;

    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

async fn fetch(locator: &str) -> Result<Bytes> {
    let locator = locator.trim();
    if locator.is_empty() {
        return Err(WavtapError::invalid_input("audio locator is empty"));
    }

    if locator.starts_with("http://") || locator.starts_with("https://") {
        return fetch_remote(locator).await;
    }

    let path = match locator.strip_prefix("file://") {
        Some(rest) => file_url_path(rest)?,
        None if locator.contains("://") => {
            return Err(WavtapError::invalid_input(format!(
                "unsupported locator scheme in `{locator}`"
            )))
        }
        None => PathBuf::from(locator),
    };

    tracing::debug!(path = %path.display(), "reading audio asset");
    let data = tokio::fs::read(&path).await?;
    Ok(Bytes::from(data))
}

/// Resolves the part of a `file://` URL after the scheme. The host must be
/// empty or `localhost`; `%XX` escapes in the path are decoded.
fn file_url_path(rest: &str) -> Result<PathBuf> {
    let (host, path) = match rest.find('/') {
        Some(index) => rest.split_at(index),
        None => (rest, ""),
    };
    if !(host.is_empty() || host.eq_ignore_ascii_case("localhost")) {
        return Err(WavtapError::invalid_input(format!(
            "file URLs must name a local path, got host `{host}`"
        )));
    }
    if path.is_empty() {
        return Err(WavtapError::invalid_input("file URL has no path"));
    }

    let mut decoded = Vec::with_capacity(path.len());
    let mut bytes = path.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            decoded.push(byte);
            continue;
        }

        let escape = bytes
            .next()
            .zip(bytes.next())
            .and_then(|(high, low)| Some((hex_value(high)? << 4) | hex_value(low)?))
            .ok_or_else(|| {
                WavtapError::invalid_input(format!("malformed escape in file URL `{path}`"))
            })?;
        decoded.push(escape);
    }

    String::from_utf8(decoded)
        .map(PathBuf::from)
        .map_err(|_| WavtapError::invalid_input(format!("file URL `{path}` is not valid UTF-8")))
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

#[cfg(feature = "http")]
async fn fetch_remote(url: &str) -> Result<Bytes> {
    tracing::debug!(url, "fetching audio asset");
    let response = reqwest::get(url)
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| WavtapError::Fetch(format!("{url}: {e}")))?;

    response
        .bytes()
        .await
        .map_err(|e| WavtapError::Fetch(format!("{url}: {e}")))
}

#[cfg(not(feature = "http"))]
async fn fetch_remote(url: &str) -> Result<Bytes> {
    Err(WavtapError::invalid_input(format!(
        "`{url}` requires the `http` feature"
    )))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    #[test]
    fn json_objects_are_rejected() {
        let err = AudioSource::try_from(json!({ "path": "song.mp3" })).unwrap_err();

        assert!(matches!(err, WavtapError::InvalidInput(_)));
        assert!(err.to_string().contains("an object"));
    }

    #[test]
    fn json_octet_arrays_become_bytes() {
        let source = AudioSource::try_from(json!([82, 73, 70, 70])).unwrap();
        assert!(matches!(source, AudioSource::Bytes(ref b) if b.as_ref() == b"RIFF"));

        let err = AudioSource::try_from(json!([1, 300])).unwrap_err();
        assert!(matches!(err, WavtapError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn reads_files_by_path_and_url() {
        let path = std::env::temp_dir().join(format!("wavtap-asset-{}.bin", std::process::id()));
        std::fs::File::create(&path).unwrap().write_all(b"abc").unwrap();

        let by_path = AudioSource::from(path.clone()).into_bytes().await.unwrap();
        let by_url = AudioSource::url(format!("file://{}", path.display()))
            .into_bytes()
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(by_path.as_ref(), b"abc");
        assert_eq!(by_url, by_path);
    }

    #[tokio::test]
    async fn file_urls_decode_escapes_and_accept_localhost() {
        let path = std::env::temp_dir().join(format!("wavtap asset {}.bin", std::process::id()));
        std::fs::File::create(&path).unwrap().write_all(b"xyz").unwrap();

        let escaped = path.display().to_string().replace(' ', "%20");
        let plain = AudioSource::url(format!("file://{escaped}")).into_bytes().await;
        let local = AudioSource::url(format!("file://localhost{escaped}")).into_bytes().await;
        std::fs::remove_file(&path).unwrap();

        assert_eq!(plain.unwrap().as_ref(), b"xyz");
        assert_eq!(local.unwrap().as_ref(), b"xyz");
    }

    #[test]
    fn file_urls_reject_remote_hosts_and_bad_escapes() {
        let err = file_url_path("example.com/song.wav").unwrap_err();
        assert!(matches!(err, WavtapError::InvalidInput(_)));

        let err = file_url_path("/tmp/song%2.wav").unwrap_err();
        assert!(matches!(err, WavtapError::InvalidInput(_)));

        assert_eq!(
            file_url_path("/tmp/caf%C3%A9.wav").unwrap(),
            PathBuf::from("/tmp/café.wav")
        );
    }

    #[tokio::test]
    async fn rejects_unknown_schemes_and_empty_input() {
        let err = AudioSource::url("ftp://example.com/a.mp3").into_bytes().await.unwrap_err();
        assert!(matches!(err, WavtapError::InvalidInput(_)));

        let err = AudioSource::bytes(Vec::new()).into_bytes().await.unwrap_err();
        assert!(matches!(err, WavtapError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_files_surface_io_errors() {
        let err = AudioSource::url("/definitely/not/here.wav").into_bytes().await.unwrap_err();
        assert!(matches!(err, WavtapError::Io(_)));
    }

    #[tokio::test]
    async fn blobs_are_read_to_the_end() {
        let source = AudioSource::blob(std::io::Cursor::new(vec![1_u8, 2, 3]));
        assert_eq!(source.kind(), "blob");
        assert_eq!(source.into_bytes().await.unwrap().as_ref(), &[1, 2, 3]);
    }
}
