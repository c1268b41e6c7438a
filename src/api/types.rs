//! Remote storage API types

use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a number that might be encoded as a string or null.
/// Sizes are sometimes returned as strings and are absent for folders.
fn deserialize_flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct FlexibleU64Visitor;

    impl<'de> de::Visitor<'de> for FlexibleU64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a u64, a string containing a u64, or null")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
            u64::try_from(value).map_err(|_| de::Error::custom("negative value for u64"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u64, E> {
            value.parse::<u64>().map_err(de::Error::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }

        fn visit_unit<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(FlexibleU64Visitor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
    Deleted,
}

/// One file or folder from a listing or metadata call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(rename = ".tag")]
    pub kind: EntryKind,
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    /// Size in bytes (0 for folders)
    #[serde(default, deserialize_with = "deserialize_flexible_u64")]
    pub size: u64,
    /// ISO 8601 timestamp of the last server-side change
    #[serde(default)]
    pub server_modified: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl FileEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

#[derive(Debug, Deserialize)]
pub struct ListFolderResponse {
    pub entries: Vec<FileEntry>,
    pub cursor: String,
    pub has_more: bool,
}

/// Conflict body returned with HTTP 409
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub error_summary: String,
}

impl ApiErrorBody {
    pub fn is_not_found(&self) -> bool {
        self.error_summary.starts_with("path/not_found")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceAllocation {
    #[serde(rename = ".tag")]
    pub kind: String,
    #[serde(default, deserialize_with = "deserialize_flexible_u64")]
    pub allocated: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceUsage {
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub used: u64,
    pub allocation: SpaceAllocation,
}

impl SpaceUsage {
    /// Used fraction of the allocation, 0.0 when unknown
    pub fn used_ratio(&self) -> f64 {
        if self.allocation.allocated == 0 {
            return 0.0;
        }
        self.used as f64 / self.allocation.allocated as f64
    }
}
