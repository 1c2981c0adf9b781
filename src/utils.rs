use std::fmt;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Session-scoped party identifier handed out by the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    pub fn new(id: impl Into<String>) -> Self {
        PartyId(id.into())
    }

    /// Random 6-digit id, short enough to read out to the other party.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let number: u32 = rng.random_range(100_000..=999_999);
        PartyId(number.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Describes the file riding alongside an envelope. Travels unencrypted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub original_name: String,
    pub mime_type: String,
    pub extension: String,
}

impl FileMetadata {
    pub fn from_name(name: &str) -> Self {
        let extension = file_extension(name).to_string();
        FileMetadata {
            original_name: name.to_string(),
            mime_type: mime_type(&extension).to_string(),
            extension,
        }
    }

    /// Metadata for the file at `path`, keyed on its final path component.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_name(&name)
    }

    /// Name to save the received file under.
    ///
    /// The sender controls `original_name`, so only its final component survives;
    /// anything unusable falls back to `received_file.<ext>`.
    pub fn download_name(&self) -> String {
        let candidate = self
            .original_name
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or_default()
            .trim();

        if candidate.is_empty() || candidate == "." || candidate == ".." {
            let extension: String = self
                .extension
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect();
            if extension.is_empty() {
                return "received_file".to_string();
            }
            return format!("received_file.{}", extension);
        }

        candidate.to_string()
    }
}

/// Text after the last `.`; empty when there is none or the name only starts with one.
pub fn file_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => "",
        Some(index) => &name[index + 1..],
    }
}

pub fn mime_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xls" => "application/vnd.ms-excel",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        _ => "application/octet-stream",
    }
}
