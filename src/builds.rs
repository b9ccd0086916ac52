// ============================================
// builds.rs - Build channels and metadata resolution
// ============================================
// This module handles:
//   - The selectable build channels and Windows editions
//   - Querying the UUP catalog API for a matching build
//   - The deterministic fallback when the catalog is unreachable
//
// The resolver NEVER fails: any transport problem, bad status, garbage
// body, or empty result set becomes a fallback descriptor plus a
// logged warning. A dead catalog service must not kill a job before
// it starts.
// ============================================

use serde::Deserialize;
use std::str::FromStr;

use crate::config::ForgeConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::retry::with_retry;

// ============================================
// CHANNELS
// ============================================

/// A selectable build channel: what the user picks, what we search the
/// catalog for, and which ring tag a candidate title must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    /// Display label shown in --list-channels and status lines
    pub label: &'static str,
    /// Free-text search tag sent to the catalog API
    pub search: &'static str,
    /// Ring tag a candidate build title must contain
    pub ring: &'static str,
}

/// All selectable channels. Order matters: it is the presentation order
/// and the default (24H2) is looked up by tag, not index.
pub const CHANNELS: &[Channel] = &[
    Channel { label: "Canary Channel (Latest Insider)", search: "Canary", ring: "Canary" },
    Channel { label: "Dev Channel (Weekly Builds)", search: "Dev", ring: "Dev" },
    Channel { label: "Beta Channel (Monthly Updates)", search: "Beta", ring: "Beta" },
    Channel { label: "Release Preview (Stable Preview)", search: "RP", ring: "RP" },
    Channel { label: "Windows 11 24H2 (Current Stable)", search: "24H2", ring: "Production" },
    Channel { label: "Windows 11 23H2 (Previous Stable)", search: "23H2", ring: "Production" },
    Channel { label: "Windows 10 22H2 (Latest Win10)", search: "22H2", ring: "Production" },
];

/// Known build numbers used when the catalog cannot be reached.
/// Channels without an entry fall back to their search tag.
const FALLBACK_BUILDS: &[(&str, &str)] = &[
    ("24H2", "26100.1"),
    ("23H2", "22631.1"),
];

/// Look up a channel by display label or search tag (case-insensitive).
pub fn find_channel(name: &str) -> Option<&'static Channel> {
    CHANNELS.iter().find(|c| {
        c.label.eq_ignore_ascii_case(name) || c.search.eq_ignore_ascii_case(name)
    })
}

/// The default selection when the user passes nothing: current stable.
pub fn default_channel() -> &'static Channel {
    find_channel("24H2").expect("24H2 channel is always present")
}

// ============================================
// EDITIONS
// ============================================

/// Windows editions offered for assembly. The converter receives the
/// edition name verbatim via its -e flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edition {
    Professional,
    Home,
    Enterprise,
    Education,
}

impl Edition {
    pub const ALL: [Edition; 4] = [
        Edition::Professional,
        Edition::Home,
        Edition::Enterprise,
        Edition::Education,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Edition::Professional => "Professional",
            Edition::Home => "Home",
            Edition::Enterprise => "Enterprise",
            Edition::Education => "Education",
        }
    }
}

impl std::fmt::Display for Edition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Edition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Edition::ALL
            .iter()
            .copied()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown edition '{}' (expected one of: Professional, Home, Enterprise, Education)",
                    s
                )
            })
    }
}

// ============================================
// BUILD DESCRIPTOR
// ============================================

/// One resolved build. Immutable once produced — the pipeline carries
/// it by reference from FetchingMetadata onward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDescriptor {
    /// Catalog id used by the download-set lookup
    pub id: String,
    /// Display title from the catalog (or the channel label on fallback)
    pub title: String,
    /// Build number string (e.g. "26100.1")
    pub build: String,
    /// Ring tag of the channel this build was resolved for
    pub ring: String,
}

impl BuildDescriptor {
    /// True when this descriptor was synthesized locally instead of
    /// resolved from the catalog.
    pub fn is_fallback(&self) -> bool {
        self.id.ends_with("_fallback")
    }
}

/// The deterministic descriptor used when the catalog gives us nothing.
pub fn fallback_descriptor(channel: &Channel) -> BuildDescriptor {
    let build = FALLBACK_BUILDS
        .iter()
        .find(|(tag, _)| *tag == channel.search)
        .map(|(_, num)| *num)
        .unwrap_or(channel.search);

    BuildDescriptor {
        id: format!("{}_fallback", channel.search),
        title: channel.label.to_string(),
        build: build.to_string(),
        ring: channel.ring.to_string(),
    }
}

// ============================================
// CATALOG WIRE FORMAT
// ============================================
// listid.php returns:
//   { "response": { "builds": { "<uuid>": { "title": ..., "build": ... } } } }
// The builds map keeps its listed order (serde_json preserve_order),
// which the first-match selection below relies on.

#[derive(Debug, Default, Deserialize)]
struct CatalogEnvelope {
    #[serde(default)]
    response: CatalogResponse,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    builds: serde_json::Map<String, serde_json::Value>,
}

/// Pick the winning build for a channel from the catalog listing:
/// the earliest-listed entry whose title contains the ring tag.
///
/// This is a first-match rule, not a best-match rule, inherited from
/// the catalog being sorted by date on the server side.
// TODO: when several same-ring builds are listed, prefer the highest
// build number instead of relying on server-side ordering.
fn select_build(builds: &serde_json::Map<String, serde_json::Value>, channel: &Channel) -> Option<BuildDescriptor> {
    for (id, value) in builds {
        let title = value.get("title").and_then(|v| v.as_str()).unwrap_or("");
        if !title.contains(channel.ring) {
            continue;
        }
        let build = value
            .get("build")
            .and_then(|v| v.as_str())
            .unwrap_or(channel.search);

        return Some(BuildDescriptor {
            id: id.clone(),
            title: title.to_string(),
            build: build.to_string(),
            ring: channel.ring.to_string(),
        });
    }
    None
}

// ============================================
// RESOLVER
// ============================================

/// Resolves a channel selection to a BuildDescriptor against the
/// catalog API, with bounded retries and a guaranteed fallback.
pub struct BuildResolver<'a> {
    config: &'a ForgeConfig,
    client: reqwest::blocking::Client,
}

impl<'a> BuildResolver<'a> {
    pub fn new(config: &'a ForgeConfig) -> ProvisionResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("WinForge/", env!("CARGO_PKG_VERSION")))
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| ProvisionError::MetadataUnavailable(format!("HTTP client: {}", e)))?;

        Ok(BuildResolver { config, client })
    }

    /// Resolve a channel to a descriptor. Never errors: the fallback
    /// descriptor is the worst case.
    pub fn resolve(&self, channel: &Channel) -> BuildDescriptor {
        let lookup = with_retry("catalog lookup", self.config.backoff(), || {
            self.fetch_catalog(channel.search)
        });

        match lookup {
            Ok(builds) => match select_build(&builds, channel) {
                Some(descriptor) => {
                    println!(
                        "[Resolver] {} -> {} ({})",
                        channel.label, descriptor.title, descriptor.build
                    );
                    descriptor
                }
                None => {
                    println!(
                        "[Resolver] no {} build in catalog listing for '{}' — using fallback",
                        channel.ring, channel.search
                    );
                    fallback_descriptor(channel)
                }
            },
            Err(err) => {
                eprintln!(
                    "[Resolver] warning ({}): {} — using fallback",
                    err.kind(),
                    err
                );
                fallback_descriptor(channel)
            }
        }
    }

    /// One catalog request. Text body parsed with serde_json — same
    /// pattern as the updater (no reqwest json feature).
    fn fetch_catalog(
        &self,
        search: &str,
    ) -> ProvisionResult<serde_json::Map<String, serde_json::Value>> {
        let url = format!("{}/listid.php", self.config.api_base);

        let response = self
            .client
            .get(&url)
            .query(&[("search", search), ("sortByDate", "1")])
            .send()
            .map_err(|e| ProvisionError::MetadataUnavailable(format!("request: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProvisionError::MetadataUnavailable(format!(
                "catalog returned status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .map_err(|e| ProvisionError::MetadataUnavailable(format!("body read: {}", e)))?;

        let envelope: CatalogEnvelope = serde_json::from_str(&body)
            .map_err(|e| ProvisionError::MetadataUnavailable(format!("bad JSON: {}", e)))?;

        Ok(envelope.response.builds)
    }
}

// ============================================
// TESTS
// ============================================
