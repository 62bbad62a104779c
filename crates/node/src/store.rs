//! Persisted operating parameters.
//!
//! The record is small and fixed-size: a four-byte version tag, the bus
//! baud rate and the leak threshold.  It is read once at boot and rewritten
//! whole whenever the host changes a parameter.
//!
//! ```text
//! offset  size  field
//!      0     4  version tag, ASCII, NUL padded ("SP2\0")
//!      4     4  baud rate, u32 LE
//!      8     2  leak threshold, u16 LE
//! ```

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{SetParamError, StorageError, ValidationError};

/// Tag of the record layout this build reads and writes.
pub const CONFIG_VERSION: [u8; 4] = *b"SP2\0";

pub const RECORD_LEN: usize = 10;

pub const DEFAULT_LEAK_THRESHOLD: u16 = 400;

/// Largest reading the leak ADC can report (15-bit single-ended).
pub const LEAK_THRESHOLD_MAX: u16 = 32767;

// ---------------------------------------------------------------------------
// Parameter types
// ---------------------------------------------------------------------------

/// Serial rates the RS-485 transceiver supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(into = "u32")]
pub enum BaudRate {
    #[default]
    B9600,
    B14400,
    B19200,
    B28800,
    B38400,
    B57600,
    B115200,
}

impl BaudRate {
    pub const ALL: [BaudRate; 7] = [
        Self::B9600,
        Self::B14400,
        Self::B19200,
        Self::B28800,
        Self::B38400,
        Self::B57600,
        Self::B115200,
    ];

    pub fn bps(self) -> u32 {
        match self {
            Self::B9600 => 9_600,
            Self::B14400 => 14_400,
            Self::B19200 => 19_200,
            Self::B28800 => 28_800,
            Self::B38400 => 38_400,
            Self::B57600 => 57_600,
            Self::B115200 => 115_200,
        }
    }

    pub fn from_bps(bps: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|b| i64::from(b.bps()) == bps)
    }
}

impl From<BaudRate> for u32 {
    fn from(b: BaudRate) -> u32 {
        b.bps()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bps())
    }
}

/// Host-settable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    BaudRate,
    LeakThreshold,
}

impl ParamId {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "baud" => Some(Self::BaudRate),
            "leak_threshold" => Some(Self::LeakThreshold),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BaudRate => "baud",
            Self::LeakThreshold => "leak_threshold",
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Configuration {
    pub baud_rate: BaudRate,
    pub leak_threshold: u16,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            baud_rate: BaudRate::default(),
            leak_threshold: DEFAULT_LEAK_THRESHOLD,
        }
    }
}

impl Configuration {
    /// Return a copy with `param` set to `value`, or the reason it is not
    /// a legal value.
    pub fn with_param(self, param: ParamId, value: i64) -> Result<Self, ValidationError> {
        match param {
            ParamId::BaudRate => {
                let baud_rate =
                    BaudRate::from_bps(value).ok_or(ValidationError::UnsupportedBaud(value))?;
                Ok(Self { baud_rate, ..self })
            }
            ParamId::LeakThreshold => {
                let leak_threshold = u16::try_from(value)
                    .ok()
                    .filter(|t| (1..=LEAK_THRESHOLD_MAX).contains(t))
                    .ok_or(ValidationError::LeakThresholdOutOfRange(value))?;
                Ok(Self {
                    leak_threshold,
                    ..self
                })
            }
        }
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&CONFIG_VERSION);
        out[4..8].copy_from_slice(&self.baud_rate.bps().to_le_bytes());
        out[8..10].copy_from_slice(&self.leak_threshold.to_le_bytes());
        out
    }
}

/// What the persisted bytes turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    /// Current layout.  `repaired` is set when a stored field was outside
    /// its domain (an unsupported baud rate, say) and its default was
    /// substituted.
    Current {
        config: Configuration,
        repaired: bool,
    },
    /// Some other revision's record (or garbage with the wrong tag).
    Outdated { tag: [u8; 4] },
    /// Nothing stored, or too short to carry a tag.
    Blank,
}

impl StoredRecord {
    pub fn decode(bytes: &[u8]) -> Self {
        let Some(tag) = bytes.get(0..4) else {
            return Self::Blank;
        };
        let mut tag_buf = [0u8; 4];
        tag_buf.copy_from_slice(tag);

        if tag_buf != CONFIG_VERSION || bytes.len() != RECORD_LEN {
            return Self::Outdated { tag: tag_buf };
        }

        let baud = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let threshold = u16::from_le_bytes([bytes[8], bytes[9]]);

        let (baud_rate, baud_repaired) = match BaudRate::from_bps(i64::from(baud)) {
            Some(b) => (b, false),
            None => (BaudRate::default(), true),
        };
        let leak_threshold = if (1..=LEAK_THRESHOLD_MAX).contains(&threshold) {
            threshold
        } else {
            DEFAULT_LEAK_THRESHOLD
        };

        Self::Current {
            config: Configuration {
                baud_rate,
                leak_threshold,
            },
            repaired: baud_repaired || leak_threshold != threshold,
        }
    }
}

/// Printable form of a tag for logs: trailing NULs dropped.
fn tag_display(tag: &[u8; 4]) -> String {
    String::from_utf8_lossy(tag)
        .trim_end_matches('\0')
        .to_string()
}

// ---------------------------------------------------------------------------
// Storage port
// ---------------------------------------------------------------------------

/// Whole-record persistence.  `write` must replace the record atomically:
/// a reset during the write leaves either the old or the new record.
pub trait ConfigStorage {
    /// `Ok(None)` when nothing has ever been stored.
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError>;
    fn write(&mut self, record: &[u8]) -> Result<(), StorageError>;
}

/// Record kept in a file; written to a sibling temp file and renamed over
/// the original.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigStorage for FileStorage {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, record: &[u8]) -> Result<(), StorageError> {
        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(record)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory record for tests and dry runs.  Can be told to fail writes.
#[derive(Default)]
pub struct MemoryStorage {
    pub record: Option<Vec<u8>>,
    pub fail_reads: bool,
    pub fail_writes: bool,
    pub writes: usize,
}

impl MemoryStorage {
    pub fn with_record(record: &[u8]) -> Self {
        Self {
            record: Some(record.to_vec()),
            ..Self::default()
        }
    }
}

impl ConfigStorage for MemoryStorage {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        if self.fail_reads {
            return Err(StorageError::Unavailable);
        }
        Ok(self.record.clone())
    }

    fn write(&mut self, record: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Unavailable);
        }
        self.record = Some(record.to_vec());
        self.writes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct ConfigStore<S: ConfigStorage> {
    storage: S,
    current: Configuration,
}

impl<S: ConfigStorage> ConfigStore<S> {
    /// Read and validate the persisted record.  An outdated or blank
    /// record is replaced by the defaults, which are then persisted.  Never
    /// fails: if the record cannot be read at all the node runs on
    /// defaults and leaves storage untouched, so the next start retries.
    pub fn load(mut storage: S) -> Self {
        let record = match storage.read() {
            Ok(Some(bytes)) => StoredRecord::decode(&bytes),
            Ok(None) => StoredRecord::Blank,
            Err(e) => {
                warn!("config read failed, running on defaults without persisting: {e}");
                return Self {
                    storage,
                    current: Configuration::default(),
                };
            }
        };

        let mut store = Self {
            storage,
            current: Configuration::default(),
        };

        match record {
            StoredRecord::Current {
                config,
                repaired: false,
            } => {
                store.current = config;
                info!(
                    baud = %config.baud_rate,
                    leak_threshold = config.leak_threshold,
                    "config loaded"
                );
            }
            StoredRecord::Current {
                config,
                repaired: true,
            } => {
                warn!("stored config had out-of-domain fields, substituting defaults for them");
                store.current = config;
                store.persist();
            }
            StoredRecord::Outdated { tag } => {
                warn!(
                    found = %tag_display(&tag),
                    expected = %tag_display(&CONFIG_VERSION),
                    "config version mismatch, resetting to defaults"
                );
                store.reset_to_defaults();
            }
            StoredRecord::Blank => {
                info!("no stored config, writing defaults");
                store.reset_to_defaults();
            }
        }

        store
    }

    pub fn config(&self) -> &Configuration {
        &self.current
    }

    /// Replace the configuration with the compiled-in defaults and persist.
    pub fn reset_to_defaults(&mut self) {
        self.current = Configuration::default();
        self.persist();
    }

    /// Persist the current configuration.
    pub fn save(&mut self) -> Result<(), StorageError> {
        self.storage.write(&self.current.encode())
    }

    /// Validate, persist, then commit.  On any error the store is unchanged.
    pub fn set(&mut self, param: ParamId, value: i64) -> Result<(), SetParamError> {
        let candidate = self.current.with_param(param, value)?;
        self.storage.write(&candidate.encode())?;
        self.current = candidate;
        info!(param = param.as_str(), value, "parameter updated");
        Ok(())
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn persist(&mut self) {
        if let Err(e) = self.save() {
            warn!("config persist failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
