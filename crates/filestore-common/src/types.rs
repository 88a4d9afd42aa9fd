//! Core type definitions for the file store
//!
//! - [`FsId`]: the hierarchical key of every stored item
//! - [`Xid`]: the two-part transaction identifier stamped on journals
//! - [`DataType`]: which of the three namespaces an item lives in

use crate::error::{Error, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Path separator used by [`FsId`]
pub const SEPARATOR: char = '/';

/// Directory name prefix reserved for hash buckets in the storage layout
pub const HASH_DIR_PREFIX: &str = "hd-";

/// Hierarchical identifier of a blob or time series.
///
/// An id is written `/seg1/seg2/.../name`: one or more directory segments
/// followed by a name. Segments never contain the separator, never start
/// with `.`, and are limited to ASCII alphanumerics plus `_-.:+=#%~`.
/// Directory segments may not start with `hd-`, which is reserved for
/// hash bucket directories.
///
/// Equality, hashing and ordering are those of the full string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{full}")]
pub struct FsId {
    full: String,
    /// Byte index of the last separator in `full`
    name_at: usize,
}

impl FsId {
    /// Build an id from a directory path (`/a/b`) and a name (`c`).
    pub fn new(path: &str, name: &str) -> Result<Self> {
        let mut full = String::with_capacity(path.len() + name.len() + 1);
        full.push_str(path.trim_end_matches(SEPARATOR));
        full.push(SEPARATOR);
        full.push_str(name);
        Self::parse(&full)
    }

    /// Parse the full string form `/a/b/c`.
    pub fn parse(s: &str) -> Result<Self> {
        let Some(rest) = s.strip_prefix(SEPARATOR) else {
            return Err(Error::InvalidFsId(format!("{s:?} must start with '/'")));
        };
        let segments: Vec<&str> = rest.split(SEPARATOR).collect();
        if segments.len() < 2 {
            return Err(Error::InvalidFsId(format!(
                "{s:?} needs at least one directory and a name"
            )));
        }
        let last = segments.len() - 1;
        for (i, seg) in segments.iter().enumerate() {
            validate_segment(s, seg)?;
            if i != last && seg.starts_with(HASH_DIR_PREFIX) {
                return Err(Error::InvalidFsId(format!(
                    "{s:?}: directory {seg:?} uses the reserved prefix {HASH_DIR_PREFIX:?}"
                )));
            }
        }
        let name_at = s.rfind(SEPARATOR).unwrap_or(0);
        Ok(Self {
            full: s.to_string(),
            name_at,
        })
    }

    /// The directory part, e.g. `/a/b` for `/a/b/c`
    #[must_use]
    pub fn path(&self) -> &str {
        &self.full[..self.name_at]
    }

    /// The trailing name, e.g. `c` for `/a/b/c`
    #[must_use]
    pub fn name(&self) -> &str {
        &self.full[self.name_at + 1..]
    }

    /// Directory segments without the name
    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.path()[1..].split(SEPARATOR)
    }

    /// The full string form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

fn validate_segment(id: &str, seg: &str) -> Result<()> {
    if seg.is_empty() {
        return Err(Error::InvalidFsId(format!("{id:?} has an empty segment")));
    }
    if seg.starts_with('.') {
        return Err(Error::InvalidFsId(format!(
            "{id:?}: segment {seg:?} starts with '.'"
        )));
    }
    if let Some(c) = seg.chars().find(|&c| !is_id_char(c)) {
        return Err(Error::InvalidFsId(format!(
            "{id:?}: character {c:?} is not allowed"
        )));
    }
    Ok(())
}

/// Characters allowed inside an [`FsId`] segment
#[must_use]
pub const fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '+' | '=' | '#' | '%' | '~')
}

impl fmt::Debug for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsId({})", self.full)
    }
}

impl FromStr for FsId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FsId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<FsId> for String {
    fn from(id: FsId) -> Self {
        id.full
    }
}

/// Transaction identifier: a global id plus a branch id.
///
/// Ordering is numeric, global first, then branch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub global: u128,
    pub branch: u128,
}

impl Xid {
    /// Size of the little-endian encoding
    pub const ENCODED_LEN: usize = 32;

    #[must_use]
    pub const fn new(global: u128, branch: u128) -> Self {
        Self { global, branch }
    }

    /// Generate a fresh transaction id
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().as_u128(), Uuid::new_v4().as_u128())
    }

    /// Little-endian encoding: global then branch
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..16].copy_from_slice(&self.global.to_le_bytes());
        buf[16..].copy_from_slice(&self.branch.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; Self::ENCODED_LEN]) -> Self {
        let mut global = [0u8; 16];
        let mut branch = [0u8; 16];
        global.copy_from_slice(&buf[..16]);
        branch.copy_from_slice(&buf[16..]);
        Self::new(u128::from_le_bytes(global), u128::from_le_bytes(branch))
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({self})")
    }
}

/// Also the file name stem of the transaction's journals.
impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}-{:032x}", self.global, self.branch)
    }
}

impl FromStr for Xid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::invalid_argument(format!("malformed transaction id {s:?}"));
        let (global, branch) = s.split_once('-').ok_or_else(bad)?;
        Ok(Self::new(
            u128::from_str_radix(global, 16).map_err(|_| bad())?,
            u128::from_str_radix(branch, 16).map_err(|_| bad())?,
        ))
    }
}

/// The three namespaces of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Blob,
    TimeSeries,
    MjdTimeSeries,
}

impl DataType {
    pub const ALL: [Self; 3] = [Self::Blob, Self::TimeSeries, Self::MjdTimeSeries];

    /// Top-level directory of this namespace in the storage layout
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::TimeSeries => "ts",
            Self::MjdTimeSeries => "mts",
        }
    }

    /// Short tag used in query patterns
    #[must_use]
    pub const fn tag(self) -> char {
        match self {
            Self::Blob => 'b',
            Self::TimeSeries => 't',
            Self::MjdTimeSeries => 'm',
        }
    }

    /// Reverse of [`DataType::dir_name`]
    #[must_use]
    pub fn from_dir_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.dir_name() == s)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Blob => "Blob",
            Self::TimeSeries => "TimeSeries",
            Self::MjdTimeSeries => "MjdTimeSeries",
        };
        f.write_str(name)
    }
}

/// Accepts the full name or its first letter, in any case.
impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "b" | "blob" => Ok(Self::Blob),
            "t" | "ts" | "timeseries" => Ok(Self::TimeSeries),
            "m" | "mts" | "mjdtimeseries" => Ok(Self::MjdTimeSeries),
            _ => Err(Error::invalid_argument(format!("unknown data type {s:?}"))),
        }
    }
}
