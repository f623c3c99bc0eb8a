//! Weight manifest (`ndarray-cache.json`)
//!
//! Lists the weight shards of a model and where each parameter lives
//! inside them.

use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = "ndarray-cache.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightManifest {
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub records: Vec<ShardRecord>,
}

/// One shard file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    #[serde(rename = "dataPath")]
    pub data_path: String,
    #[serde(default)]
    pub format: Option<String>,
    pub nbytes: u64,
    /// Optional content digest, lowercase hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub records: Vec<ParamRecord>,
}

/// One parameter tensor inside a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamRecord {
    pub name: String,
    #[serde(default)]
    pub shape: Vec<u64>,
    pub dtype: String,
    #[serde(default)]
    pub format: Option<String>,
    pub nbytes: u64,
    #[serde(rename = "byteOffset")]
    pub byte_offset: u64,
}

/// Location of a parameter: shard index plus byte range inside it
#[derive(Debug, Clone, PartialEq)]
pub struct ParamLocation<'a> {
    pub shard_index: usize,
    pub shard: &'a ShardRecord,
    pub param: &'a ParamRecord,
}

impl WeightManifest {
    /// Parse a manifest and check that every parameter fits in its shard
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let manifest: WeightManifest =
            serde_json::from_slice(data).map_err(|e| format!("invalid weight manifest: {e}"))?;

        for shard in &manifest.records {
            if shard.data_path.is_empty() || shard.data_path.contains("..") {
                return Err(format!("invalid shard path {:?}", shard.data_path));
            }
            for param in &shard.records {
                let end = param.byte_offset.checked_add(param.nbytes);
                if end.map_or(true, |end| end > shard.nbytes) {
                    return Err(format!(
                        "parameter {} overruns shard {} ({} bytes)",
                        param.name, shard.data_path, shard.nbytes
                    ));
                }
            }
        }
        Ok(manifest)
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|s| s.nbytes).sum()
    }

    pub fn locate(&self, name: &str) -> Option<ParamLocation<'_>> {
        self.records.iter().enumerate().find_map(|(shard_index, shard)| {
            shard
                .records
                .iter()
                .find(|p| p.name == name)
                .map(|param| ParamLocation { shard_index, shard, param })
        })
    }
}
