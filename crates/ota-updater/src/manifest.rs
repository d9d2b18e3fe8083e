use std::cmp::Ordering;
use std::collections::HashSet;

use ota_proto::ota::v1::ManifestSummary;
use serde::Deserialize;

use crate::error::UpdateError;

pub const PAYLOAD_BINARY: &str = "payload.bin";
pub const PAYLOAD_METADATA: &str = "payload_metadata.bin";
pub const PAYLOAD_PROPERTIES: &str = "payload_properties.txt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbInstallType {
    NonStreaming,
    Streaming,
    NotAvailable,
}

/// A named half-open byte range `[offset, offset + size)` inside the package.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PackageFile {
    pub filename: String,
    pub offset: u64,
    pub size: u64,
}

impl PackageFile {
    pub fn end_inclusive(&self) -> Option<u64> {
        self.size
            .checked_sub(1)
            .and_then(|len| self.offset.checked_add(len))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AbConfig {
    pub verify_payload_metadata: bool,
    pub property_files: Vec<PackageFile>,
    pub authorization: String,
}

/// Remote update descriptor for one channel and device.
///
/// `raw_json` holds the exact text the manifest was parsed from so that
/// persisting and restoring it is lossless.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub name: String,
    pub url: String,
    pub changelog_url: String,
    pub build_date_utc: i64,
    pub version: String,
    pub ab_install_type: Option<AbInstallType>,
    pub ab_config: AbConfig,
    #[serde(skip)]
    pub raw_json: String,
}

impl Manifest {
    pub fn parse(raw: &str) -> Result<Self, UpdateError> {
        let mut manifest: Manifest = serde_json::from_str(raw)
            .map_err(|e| UpdateError::Malformed(format!("manifest json: {e}")))?;
        manifest.raw_json = raw.to_string();
        manifest.validate()?;
        Ok(manifest)
    }

    /// The "no update" sentinel.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.url.is_empty()
            && self.changelog_url.is_empty()
            && self.build_date_utc == 0
            && self.version.is_empty()
            && self.ab_config.property_files.is_empty()
    }

    pub fn package_file(&self, filename: &str) -> Option<&PackageFile> {
        self.ab_config
            .property_files
            .iter()
            .find(|file| file.filename == filename)
    }

    pub fn payload_size(&self) -> Option<u64> {
        self.package_file(PAYLOAD_BINARY).map(|file| file.size)
    }

    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            name: self.name.clone(),
            url: self.url.clone(),
            changelog_url: self.changelog_url.clone(),
            build_date_utc: self.build_date_utc,
            version: self.version.clone(),
            payload_size_bytes: self.payload_size().unwrap_or_default(),
        }
    }

    fn validate(&self) -> Result<(), UpdateError> {
        if self.is_empty() {
            return Ok(());
        }
        if self.name.trim().is_empty() {
            return Err(UpdateError::Malformed("manifest missing name".into()));
        }
        if self.url.trim().is_empty() {
            return Err(UpdateError::Malformed("manifest missing url".into()));
        }
        if self.build_date_utc <= 0 && self.version.trim().is_empty() {
            return Err(UpdateError::Malformed(
                "manifest missing build_date_utc and version".into(),
            ));
        }
        let mut seen = HashSet::new();
        for file in &self.ab_config.property_files {
            if file.filename.is_empty() {
                return Err(UpdateError::Malformed("property file without name".into()));
            }
            if !seen.insert(file.filename.as_str()) {
                return Err(UpdateError::Malformed(format!(
                    "duplicate property file {}",
                    file.filename
                )));
            }
            if file.end_inclusive().is_none() {
                return Err(UpdateError::Malformed(format!(
                    "property file {} has an empty or overflowing range",
                    file.filename
                )));
            }
        }
        let mut required = vec![PAYLOAD_BINARY, PAYLOAD_PROPERTIES];
        if self.ab_config.verify_payload_metadata {
            required.push(PAYLOAD_METADATA);
        }
        for filename in required {
            if self.package_file(filename).is_none() {
                return Err(UpdateError::Malformed(format!("manifest has no {filename}")));
            }
        }
        Ok(())
    }
}

/// Which build identifier decides whether a manifest is newer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ComparePolicy {
    #[default]
    BuildDate,
    Version,
}

impl ComparePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "build_date" | "build-date" | "timestamp" => Some(ComparePolicy::BuildDate),
            "version" => Some(ComparePolicy::Version),
            _ => None,
        }
    }
}

/// Identity of the running system build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildInfo {
    pub device: String,
    pub build_date_utc: i64,
    pub version: String,
}

pub fn is_newer(manifest: &Manifest, current: &BuildInfo, policy: ComparePolicy) -> bool {
    if manifest.is_empty() {
        return false;
    }
    match policy {
        ComparePolicy::BuildDate => manifest.build_date_utc > current.build_date_utc,
        ComparePolicy::Version => {
            !manifest.version.trim().is_empty()
                && compare_versions(&manifest.version, &current.version) == Ordering::Greater
        }
    }
}

/// Compares dotted versions component by component as integers, ignoring a
/// trailing build flavor such as `-UNOFFICIAL`. Missing components count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = version_components(a);
    let right = version_components(b);
    let len = left.len().max(right.len());
    for idx in 0..len {
        let l = left.get(idx).copied().unwrap_or(0);
        let r = right.get(idx).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn version_components(version: &str) -> Vec<u64> {
    let base = version.trim().split('-').next().unwrap_or_default();
    base.split('.')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u64>().unwrap_or(0)
        })
        .collect()
}
