//! Product lookups backing issuance and redemption.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A catalog entry as far as downloads are concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub author: String,
    /// Whether the product is currently offered.
    #[serde(default)]
    pub is_active: bool,
    /// Storage location of the ebook file, if one has been uploaded.
    #[serde(default)]
    pub file_url: Option<String>,
}

impl Product {
    /// Lowercased extension of the stored file, ignoring any query string.
    /// Defaults to `pdf`.
    pub fn file_extension(&self) -> String {
        self.file_url
            .as_deref()
            .map(|url| url.split(['?', '#']).next().unwrap_or(url))
            .and_then(|path| path.rsplit('/').next())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "pdf".to_string())
    }

    /// `"<title> - <author>.<ext>"`, safe to embed in a quoted
    /// `Content-Disposition` filename.
    pub fn download_filename(&self) -> String {
        let name = format!("{} - {}.{}", self.title, self.author, self.file_extension());
        name.chars()
            .map(|c| match c {
                '"' | '\\' | '/' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect()
    }

    pub fn content_type(&self) -> &'static str {
        match self.file_extension().as_str() {
            "pdf" => "application/pdf",
            "epub" => "application/epub+zip",
            "mobi" => "application/x-mobipocket-ebook",
            _ => "application/octet-stream",
        }
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns the product, active or not, or `None` if it does not exist.
    async fn find_product(&self, resource_id: &str) -> anyhow::Result<Option<Product>>;
}
