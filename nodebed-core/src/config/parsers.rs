use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;

use crate::util::file_read_sync;

/// Parse a JSON or TOML document; JSON is recognised by a leading `{`.
pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}

pub fn parse_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let content =
        file_read_sync(path).with_context(|| format!("reading config {}", path.display()))?;
    parse_from_slice(&content).with_context(|| format!("parsing config {}", path.display()))
}
