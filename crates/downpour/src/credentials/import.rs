//! Credential intake for the pool
//!
//! This module provides functionality to:
//! - Scan a cookie directory and register every valid Netscape file
//! - Fetch a credential bundle over HTTP(S) and register it
//! - Sniff Netscape cookie format and infer the owning provider

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use backon::{ExponentialBuilder, Retryable};
use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use secrecy::SecretString;
use strum::IntoEnumIterator;
use uuid::Uuid;

use crate::credentials::{CredentialKind, CredentialPool};
use crate::source::Provider;

/// Shared HTTP client for bundle fetches.
static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|e| {
            log::warn!("Failed to build HTTP client with timeout: {}, using default", e);
            reqwest::Client::new()
        })
});

/// Result of a cookie-directory scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Scans `dir` for `*.txt` Netscape cookie files and registers each one as a
/// cookie credential. `~` is expanded. Files that fail the format sniff are
/// skipped with a warning, not treated as fatal.
pub async fn import_cookie_directory(pool: &CredentialPool, dir: &str) -> Result<ImportSummary> {
    let expanded = shellexpand::tilde(dir).to_string();
    let mut summary = ImportSummary::default();

    let mut entries = fs_err::tokio::read_dir(&expanded).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_cookie_file(&path) {
            continue;
        }

        let content = match fs_err::tokio::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                log::warn!("⚠️ Cannot read cookie file {}: {}", path.display(), e);
                summary.skipped += 1;
                continue;
            }
        };

        if !looks_like_netscape(&content) {
            log::warn!("⚠️ Skipping {}: not in Netscape cookie format", path.display());
            summary.skipped += 1;
            continue;
        }

        let label = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("cookies")
            .to_string();
        let provider = infer_provider(&label, &content);
        pool.add(provider, CredentialKind::CookieFile, SecretString::from(content), Some(label))
            .await;
        summary.imported += 1;
    }

    log::info!(
        "🍪 Cookie import from {}: {} registered, {} skipped",
        expanded,
        summary.imported,
        summary.skipped
    );

    Ok(summary)
}

/// Fetches a credential bundle over HTTP(S) and registers it for `provider`
/// under the `remote-bundle` label. Returns the new credential id.
pub async fn import_remote(pool: &CredentialPool, provider: Provider, url: &str) -> Result<Uuid> {
    let content = fetch_remote_bundle(url).await?;
    let id = pool
        .add(
            provider,
            CredentialKind::CookieFile,
            SecretString::from(content),
            Some("remote-bundle".to_string()),
        )
        .await;

    log::info!("🍪 Remote credential bundle registered for {} from {}", provider, url);

    Ok(id)
}

/// Fetches a bundle body with exponential backoff on transient failures
/// (timeouts, connection errors, 429, 5xx). The body may be raw Netscape
/// text or base64-encoded.
pub async fn fetch_remote_bundle(url: &str) -> Result<String> {
    let fetch = || async {
        let response = HTTP.get(url).send().await?;
        response.error_for_status()?.text().await
    };

    let body = fetch
        .retry(ExponentialBuilder::default())
        .when(retryable_http)
        .notify(|err: &reqwest::Error, delay: Duration| {
            log::warn!("⚠️ Bundle fetch failed (retrying in {:?}): {}", delay, err);
        })
        .await?;

    decode_bundle(body)
}

fn retryable_http(err: &reqwest::Error) -> bool {
    err.is_timeout()
        || err.is_connect()
        || err
            .status()
            .map_or(false, |s| s.is_server_error() || s.as_u16() == 429)
}

fn decode_bundle(body: String) -> Result<String> {
    if looks_like_netscape(&body) {
        return Ok(body);
    }

    // Operators often ship bundles base64-wrapped to survive copy-paste.
    let decoded = general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| anyhow::anyhow!("bundle is neither Netscape text nor base64: {}", e))?;
    let text = String::from_utf8(decoded).map_err(|e| anyhow::anyhow!("invalid UTF-8 in bundle: {}", e))?;

    if !looks_like_netscape(&text) {
        return Err(anyhow::anyhow!(
            "decoded bundle is not in Netscape HTTP Cookie File format"
        ));
    }

    Ok(text)
}

fn is_cookie_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("txt"))
        .unwrap_or(false)
}

/// Netscape format: header line, or data lines of
/// domain TAB flag TAB path TAB secure TAB expires TAB name TAB value.
fn looks_like_netscape(content: &str) -> bool {
    if content.lines().any(|l| l.contains("Netscape HTTP Cookie File")) {
        return true;
    }

    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .any(|l| l.split('\t').count() >= 7)
}

/// Guesses the owning provider: explicit file-name prefix first
/// (`spotify_premium.txt`), then the cookie domains inside the file,
/// then YouTube as the historical default.
fn infer_provider(label: &str, content: &str) -> Provider {
    if let Some(prefix) = label.split(['-', '_', '.']).next() {
        if let Ok(provider) = prefix.to_lowercase().parse::<Provider>() {
            return provider;
        }
    }

    let mut best: Option<(Provider, usize)> = None;
    for provider in Provider::iter() {
        let hits = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter(|l| domain_matches(provider, l.split('\t').next().unwrap_or("")))
            .count();
        if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
            best = Some((provider, hits));
        }
    }

    best.map_or(Provider::YouTube, |(provider, _)| provider)
}

fn domain_matches(provider: Provider, domain: &str) -> bool {
    match provider {
        Provider::YouTube => domain.contains("youtube.com") || domain.contains("google.com"),
        Provider::Spotify => domain.contains("spotify.com"),
        Provider::Instagram => domain.contains("instagram.com"),
        Provider::SoundCloud => domain.contains("soundcloud.com"),
    }
}
