//! Configuration blob framing.
//!
//! A configuration blob is produced by the host and handed to a device verbatim at construction.
//! The bus and the loader never look inside; only the device decodes it.
//!
//! Two layouts are understood by [`ConfigBlob::decode`]:
//!
//! ```text
//! version 0 (baseline): | value: u32 (native endian) |                       4 bytes
//!
//! version 1:            | "BSCF" | ver=1 | count | 0 0 | field0 (u32 LE) | ...
//!                         4        1       1       2     4 * count
//! ```
//!
//! Field 0 is the primary field and carries the same meaning as the baseline value (RAM size,
//! motherboard slot count, requested RDMA capacity). Further fields are device-defined.

use std::sync::Arc;

use crate::error::ConfigError;

pub const CONFIG_MAGIC: [u8; 4] = *b"BSCF";
pub const CONFIG_VERSION: u8 = 1;
pub const CONFIG_HEADER_LEN: usize = 8;
pub const BASELINE_LEN: usize = 4;

/// Immutable configuration bytes owned by a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigBlob {
    bytes: Arc<[u8]>,
}

impl ConfigBlob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Baseline blob: a single native-endian `u32`.
    pub fn from_u32(value: u32) -> Self {
        Self::new(value.to_ne_bytes().to_vec())
    }

    /// Version 1 blob carrying `fields` in order.
    ///
    /// # Panics
    ///
    /// Panics if more than 255 fields are supplied.
    pub fn from_fields(fields: &[u32]) -> Self {
        let count = u8::try_from(fields.len()).expect("at most 255 configuration fields");
        let mut out = Vec::with_capacity(CONFIG_HEADER_LEN + fields.len() * 4);
        out.extend_from_slice(&CONFIG_MAGIC);
        out.push(CONFIG_VERSION);
        out.push(count);
        out.extend_from_slice(&[0, 0]);
        for field in fields {
            out.extend_from_slice(&field.to_le_bytes());
        }
        Self::new(out)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn decode(&self) -> Result<ConfigRecord, ConfigError> {
        ConfigRecord::decode(&self.bytes)
    }
}

impl From<Vec<u8>> for ConfigBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for ConfigBlob {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

/// Decoded view of a configuration blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    version: u8,
    fields: Vec<u32>,
}

impl ConfigRecord {
    pub fn decode(buf: &[u8]) -> Result<Self, ConfigError> {
        if buf.is_empty() {
            return Ok(Self {
                version: 0,
                fields: Vec::new(),
            });
        }

        if buf.len() == BASELINE_LEN {
            let value = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
            return Ok(Self {
                version: 0,
                fields: vec![value],
            });
        }

        if buf.len() < CONFIG_HEADER_LEN || buf[..4] != CONFIG_MAGIC {
            return Err(ConfigError::BadLength { len: buf.len() });
        }

        let version = buf[4];
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion { version });
        }
        if buf[6] != 0 || buf[7] != 0 {
            return Err(ConfigError::NonZeroReserved);
        }

        let declared = usize::from(buf[5]);
        let body = &buf[CONFIG_HEADER_LEN..];
        if body.len() % 4 != 0 || body.len() / 4 != declared {
            return Err(ConfigError::FieldCountMismatch {
                declared,
                actual: body.len() / 4,
            });
        }

        let fields = body
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self { version, fields })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn fields(&self) -> &[u32] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<u32> {
        self.fields.get(index).copied()
    }

    /// The baseline value (field 0), if present.
    pub fn primary(&self) -> Option<u32> {
        self.field(0)
    }
}
