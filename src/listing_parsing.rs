use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::entry::Entry;

lazy_static::lazy_static! {
    // the page embeds the same JSON document the host serves to `Accept: application/json`
    static ref REGEX_EMBEDDED_DATA: Regex = Regex::new(
        r#"(?s)<script[^>]*\bdata-target="react-app\.embeddedData"[^>]*>(.*?)</script>"#
    )
    .unwrap();
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("listing is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("page does not contain an embedded data block")]
    NoEmbeddedData,
    #[error("invalid listing document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("listing has no `payload.tree.items` array")]
    MissingItems,
    #[error("file page has no `payload.blob.rawBlobUrl`")]
    MissingRawUrl,
}

/// Extracts the entries of a folder, in listing order.
///
/// Accepts the JSON document directly or an HTML page that embeds it.
pub fn parse_listing(data: &[u8]) -> Result<Vec<Entry>, ListingError> {
    let document = parse_document(data)?;
    let items = document
        .pointer("/payload/tree/items")
        .filter(|items| items.is_array())
        .ok_or(ListingError::MissingItems)?;

    Ok(Vec::<Entry>::deserialize(items)?)
}

/// Extracts the raw content url from a file page. It may be host-relative.
pub fn parse_raw_blob_url(data: &[u8]) -> Result<String, ListingError> {
    let document = parse_document(data)?;
    document
        .pointer("/payload/blob/rawBlobUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ListingError::MissingRawUrl)
}

fn parse_document(data: &[u8]) -> Result<Value, ListingError> {
    let content = std::str::from_utf8(data)?;

    if content.trim_start().starts_with('{') {
        return Ok(serde_json::from_str(content)?);
    }

    let embedded = REGEX_EMBEDDED_DATA
        .captures(content)
        .and_then(|c| c.get(1))
        .ok_or(ListingError::NoEmbeddedData)?;

    Ok(serde_json::from_str(embedded.as_str())?)
}
