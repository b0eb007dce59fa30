//! Over-the-air update support
//!
//! The cloud publishes a firmware manifest at `.u/desired` and serves
//! component binaries under `.u/c/<package>@<version>` as 1024-byte
//! blocks. The engine stays size-agnostic; this adapter parses the
//! manifest, iterates the block indices and reports progress back.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::debug;

use stratus_core::transport::{content_format, BLOCK_SIZE};
use stratus_core::{Client, Error, GetHandler, Result};

/// Manifest resource path.
pub const MANIFEST_PATH: &str = ".u/desired";

/// Prefix of component resources.
pub const COMPONENT_PREFIX: &str = ".u/c/";

/// Longest accepted package name. Sized so `.u/c/<package>@<version>`
/// always fits the engine's path bound.
pub const MAX_PACKAGE_NAME_LEN: usize = 28;

/// Longest accepted version string.
pub const MAX_VERSION_LEN: usize = 28;

/// Most components accepted per manifest.
pub const MAX_COMPONENTS: usize = 4;

/// Update progress reported to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Nothing in progress
    Idle = 0,
    /// Blocks are being fetched
    Downloading = 1,
    /// All blocks stored locally
    Downloaded = 2,
    /// The new image is being applied
    Updating = 3,
}

/// Why the device is in its reported state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Ready to proceed
    Ready = 0,
    /// The new firmware is live
    FirmwareUpdatedSuccessfully = 1,
    /// Not enough flash for the image
    NotEnoughFlash = 2,
    /// Not enough RAM to proceed
    OutOfRam = 3,
    /// Connectivity was lost mid-update
    ConnectionLost = 4,
    /// The image failed its integrity check
    IntegrityCheckFailure = 5,
    /// The package type is not supported
    UnsupportedPackageType = 6,
    /// The component URI is invalid
    InvalidUri = 7,
    /// Applying the image failed
    FirmwareUpdateFailed = 8,
    /// The transfer protocol is not supported
    UnsupportedProtocol = 9,
}

/// One downloadable artifact in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Package name
    pub package: String,
    /// Version string
    pub version: String,
    /// Total size in bytes
    pub size: u64,
}

/// A parsed firmware manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Monotonic manifest revision
    pub seqnum: i64,
    /// Components the device should be running
    pub components: Vec<Component>,
}

impl Manifest {
    /// Parse a manifest notification payload.
    ///
    /// Shape violations (missing keys, wrong types, over-long names,
    /// too many components) fail with [`Error::InvalidFormat`].
    pub fn from_payload(payload: &[u8]) -> Result<Manifest> {
        let root: Value = serde_json::from_slice(payload).map_err(|_| Error::InvalidFormat)?;

        let seqnum = root
            .get("sequenceNumber")
            .and_then(Value::as_i64)
            .ok_or(Error::InvalidFormat)?;

        let mut components = Vec::new();
        if let Some(entries) = root.get("components").and_then(Value::as_array) {
            if entries.len() > MAX_COMPONENTS {
                return Err(Error::InvalidFormat);
            }
            for entry in entries {
                let package = entry
                    .get("package")
                    .and_then(Value::as_str)
                    .ok_or(Error::InvalidFormat)?;
                let version = entry
                    .get("version")
                    .and_then(Value::as_str)
                    .ok_or(Error::InvalidFormat)?;
                let size = entry
                    .get("size")
                    .and_then(Value::as_u64)
                    .ok_or(Error::InvalidFormat)?;
                if package.len() > MAX_PACKAGE_NAME_LEN || version.len() > MAX_VERSION_LEN {
                    return Err(Error::InvalidFormat);
                }
                components.push(Component {
                    package: package.to_string(),
                    version: version.to_string(),
                    size,
                });
            }
        }

        Ok(Manifest { seqnum, components })
    }

    /// Find a component by package name.
    pub fn find_component(&self, package: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.package == package)
    }
}

/// Number of 1024-byte blocks covering `size` bytes.
pub fn size_to_nblocks(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64)
}

/// OTA operations for one client.
pub struct Ota {
    client: Arc<Client>,
}

impl Ota {
    /// Wrap a client.
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    /// Observe the desired-firmware manifest. The handler receives raw
    /// payloads; parse them with [`Manifest::from_payload`].
    pub fn observe_manifest(&self, handler: GetHandler) -> Result<()> {
        self.client
            .observe_async("", MANIFEST_PATH, content_format::JSON, handler)
    }

    /// Report update progress for a package and wait for the
    /// acknowledgement.
    pub async fn report_state(
        &self,
        state: State,
        reason: Reason,
        package: &str,
        current_version: Option<&str>,
        target_version: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut report = json!({
            "state": state as i64,
            "reason": reason as i64,
            "package": package,
        });
        if let Some(version) = current_version {
            report["version"] = Value::from(version);
        }
        if let Some(target) = target_version {
            report["target"] = Value::from(target);
        }
        let payload = serde_json::to_vec(&report).map_err(|_| Error::Serialize)?;
        self.client
            .post(
                COMPONENT_PREFIX,
                package,
                content_format::JSON,
                &payload,
                timeout,
            )
            .await
    }

    /// Fetch one block of a component and wait for its bytes.
    pub async fn get_block(
        &self,
        package: &str,
        version: &str,
        block_index: u32,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        if package.len() > MAX_PACKAGE_NAME_LEN || version.len() > MAX_VERSION_LEN {
            return Err(Error::InvalidFormat);
        }
        let path = format!("{}@{}", package, version);
        self.client
            .get_block(
                COMPONENT_PREFIX,
                &path,
                content_format::OCTET_STREAM,
                block_index,
                timeout,
            )
            .await
    }

    /// Download a whole component, feeding each block to `on_block` in
    /// order. Returns the number of bytes received.
    pub async fn download(
        &self,
        component: &Component,
        timeout: Option<Duration>,
        mut on_block: impl FnMut(u32, &[u8]) -> Result<()>,
    ) -> Result<u64> {
        let nblocks = size_to_nblocks(component.size);
        let mut received = 0u64;
        for index in 0..nblocks {
            let block = self
                .get_block(&component.package, &component.version, index as u32, timeout)
                .await?;
            received += block.len() as u64;
            on_block(index as u32, &block)?;
        }
        debug!(
            package = %component.package,
            bytes = received,
            "component download complete"
        );
        Ok(received)
    }
}
