//! Release feed payloads (GitHub releases API) and asset selection.

use serde::Deserialize;

use crate::types::RemoteRelease;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GithubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub assets: Vec<GithubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GithubAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Archive name published for `version` on `platform`, e.g.
/// `sing-box-1.10.0-linux-amd64.zip`.
pub fn asset_name(product: &str, version: &str, platform: &str) -> String {
    format!("{}-{}-{}.zip", product, version, platform)
}

impl GithubRelease {
    /// Version without the tag's leading `v`.
    pub fn version(&self) -> &str {
        self.tag_name.strip_prefix('v').unwrap_or(&self.tag_name)
    }

    /// Converts to a `RemoteRelease` when an asset for `platform` exists.
    /// Only the exact expected file name matches.
    pub fn for_platform(&self, product: &str, platform: &str) -> Option<RemoteRelease> {
        let expected = asset_name(product, self.version(), platform);
        let asset = self.assets.iter().find(|a| a.name == expected)?;
        Some(RemoteRelease {
            version: self.version().to_string(),
            tag: self.tag_name.clone(),
            published_at: self.published_at.clone(),
            is_prerelease: self.prerelease,
            download_url: asset.browser_download_url.clone(),
            asset_name: asset.name.clone(),
        })
    }
}
