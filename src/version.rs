//! Tool version comparison and capability probing.
//!
//! Version strings come from tools and from users in loose forms such as
//! `"CIVET-2.1.0-LBL"` or `"recon-all v7.1"`. The numeric core is the longest
//! dotted run of digits; versions of unequal length are zero-padded before
//! comparison, so `"2.1"` equals `"2.1.0"`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Dotted numeric run, e.g. `2.1.0` inside `CIVET-2.1.0-LBL`.
static NUMERIC_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)*").unwrap());

/// A parsed tool version. Keeps the raw string for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolVersion {
    raw: String,
    segments: Vec<u64>,
}

impl ToolVersion {
    /// Extract the numeric version from `raw`.
    pub fn parse(raw: &str) -> Result<Self> {
        let best = NUMERIC_RUN_RE
            .find_iter(raw)
            .map(|m| {
                // Only digits reach here, so a parse error means overflow.
                m.as_str()
                    .split('.')
                    .map(|s| s.parse().unwrap_or(u64::MAX))
                    .collect::<Vec<u64>>()
            })
            .fold(None::<Vec<u64>>, |best, candidate| match best {
                Some(b) if b.len() >= candidate.len() => Some(b),
                _ => Some(candidate),
            });

        match best {
            Some(segments) => Ok(Self {
                raw: raw.to_string(),
                segments,
            }),
            None => Err(Error::MalformedVersion(raw.to_string())),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Numeric core as `a.b.c`.
    pub fn numeric(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn compare(&self, other: &ToolVersion) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }

    /// True when this version is at or above `minimum`.
    pub fn is_at_least(&self, minimum: &str) -> Result<bool> {
        let minimum = ToolVersion::parse(minimum)?;
        Ok(self.compare(&minimum) != Ordering::Less)
    }

    /// Exact match after zero padding.
    pub fn is_version(&self, other: &str) -> Result<bool> {
        let other = ToolVersion::parse(other)?;
        Ok(self.compare(&other) == Ordering::Equal)
    }
}

impl PartialEq for ToolVersion {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for ToolVersion {}

impl PartialOrd for ToolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ToolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    Ok(ToolVersion::parse(a)?.compare(&ToolVersion::parse(b)?))
}

pub fn is_at_least(current: &str, minimum: &str) -> Result<bool> {
    ToolVersion::parse(current)?.is_at_least(minimum)
}

// ========== Capability probing ==========

/// Source of raw tool version strings.
#[async_trait]
pub trait VersionProber: Send + Sync {
    async fn probe(&self, tool: &str) -> Result<String>;
}

/// Versions declared up front, typically from `Config::tool_versions`.
#[derive(Debug, Clone, Default)]
pub struct StaticProber {
    versions: BTreeMap<String, String>,
}

impl StaticProber {
    pub fn new(versions: BTreeMap<String, String>) -> Self {
        Self { versions }
    }

    pub fn with(mut self, tool: impl Into<String>, version: impl Into<String>) -> Self {
        self.versions.insert(tool.into(), version.into());
        self
    }
}

#[async_trait]
impl VersionProber for StaticProber {
    async fn probe(&self, tool: &str) -> Result<String> {
        self.versions
            .get(tool)
            .cloned()
            .ok_or_else(|| Error::Environment(format!("no declared version for tool '{}'", tool)))
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs `<tool> --version` and returns the first non-empty output line.
#[derive(Debug, Clone, Default)]
pub struct CommandProber;

#[async_trait]
impl VersionProber for CommandProber {
    async fn probe(&self, tool: &str) -> Result<String> {
        let program = which::which(tool)
            .map_err(|e| Error::Environment(format!("tool '{}' not found: {}", tool, e)))?;
        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            tokio::process::Command::new(program)
                .arg("--version")
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(PROBE_TIMEOUT))??;
        let text = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        text.lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::Environment(format!("'{} --version' printed nothing", tool)))
    }
}

/// Declared versions first, then the command, memoized per tool.
pub struct CapabilityProbe {
    declared: StaticProber,
    fallback: Option<Box<dyn VersionProber>>,
    cache: Mutex<HashMap<String, String>>,
}

impl CapabilityProbe {
    pub fn new(declared: StaticProber) -> Self {
        Self {
            declared,
            fallback: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fallback(mut self, prober: impl VersionProber + 'static) -> Self {
        self.fallback = Some(Box::new(prober));
        self
    }

    /// Raw version string for `tool`, probing at most once until invalidated.
    pub async fn resolve(&self, tool: &str) -> Result<String> {
        if let Some(hit) = self.cached(tool) {
            return Ok(hit);
        }

        let raw = match self.declared.probe(tool).await {
            Ok(raw) => raw,
            Err(declared_err) => match &self.fallback {
                Some(prober) => prober.probe(tool).await?,
                None => return Err(declared_err),
            },
        };
        tracing::debug!(tool, version = %raw, "Resolved tool version");

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(tool.to_string(), raw.clone());
        }
        Ok(raw)
    }

    pub fn invalidate(&self, tool: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(tool);
        }
    }

    fn cached(&self, tool: &str) -> Option<String> {
        self.cache.lock().ok()?.get(tool).cloned()
    }
}
