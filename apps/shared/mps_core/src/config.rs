//! Runtime configuration for the core
//!
//! Every section deserializes with defaults, so an empty JSON object is a
//! valid configuration. Hosts embed [`CoreConfig`] in their own config file
//! and validate it against the generated JSON schema.

use std::fmt;
use std::time::Duration;

use mps_protocol::DEFAULT_MAX_FRAME_SIZE;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Largest frame a session reads or writes, in bytes
///
/// Written as a number or with a `K`/`M` suffix (`65536`, `"64K"`, `"25M"`).
/// Frames carry a 4-byte length prefix, so the limit is non-zero and fits a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FrameLimitRepr", into = "FrameLimitRepr")]
pub struct FrameLimit(usize);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FrameLimitRepr {
    Bytes(u64),
    Text(String),
}

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

impl FrameLimit {
    pub fn new(bytes: usize) -> Result<Self, String> {
        if bytes == 0 {
            return Err("frame limit must be at least one byte".to_string());
        }
        if u32::try_from(bytes).is_err() {
            return Err(format!("frame limit {} exceeds the 4-byte length prefix", bytes));
        }
        Ok(Self(bytes))
    }

    /// Parse `"512"`, `"64K"` or `"25M"` (suffix is case-insensitive)
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let (digits, unit) = match text.char_indices().last() {
            Some((at, 'k' | 'K')) => (&text[..at], KIB),
            Some((at, 'm' | 'M')) => (&text[..at], MIB),
            _ => (text, 1),
        };
        let count: usize = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid frame limit '{}'", text))?;
        let bytes = count
            .checked_mul(unit)
            .ok_or_else(|| format!("frame limit '{}' is too large", text))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> usize {
        self.0
    }
}

impl Default for FrameLimit {
    fn default() -> Self {
        Self(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl fmt::Display for FrameLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            bytes if bytes % MIB == 0 => write!(f, "{}M", bytes / MIB),
            bytes if bytes % KIB == 0 => write!(f, "{}K", bytes / KIB),
            bytes => write!(f, "{}", bytes),
        }
    }
}

impl TryFrom<FrameLimitRepr> for FrameLimit {
    type Error = String;

    fn try_from(repr: FrameLimitRepr) -> Result<Self, Self::Error> {
        match repr {
            FrameLimitRepr::Bytes(bytes) => {
                let bytes = usize::try_from(bytes).map_err(|e| e.to_string())?;
                Self::new(bytes)
            }
            FrameLimitRepr::Text(text) => Self::parse(&text),
        }
    }
}

impl From<FrameLimit> for FrameLimitRepr {
    fn from(limit: FrameLimit) -> Self {
        FrameLimitRepr::Text(limit.to_string())
    }
}

impl JsonSchema for FrameLimit {
    fn schema_name() -> String {
        "FrameLimit".to_string()
    }

    fn json_schema(_gen: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        use schemars::schema::{InstanceType, Schema, SchemaObject, SingleOrVec};

        let mut schema = SchemaObject {
            instance_type: Some(SingleOrVec::Vec(vec![
                InstanceType::Integer,
                InstanceType::String,
            ])),
            ..Default::default()
        };
        schema.metadata().description =
            Some("Bytes as a number, or a string with a K or M suffix".to_string());
        Schema::Object(schema)
    }
}

/// Remote procedure call settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RpcConfig {
    /// Milliseconds before an unanswered call is rejected (0 disables the timeout)
    #[serde(default = "default_timeout_ms")]
    #[schemars(description = "Milliseconds before an unanswered remote procedure call is rejected; 0 waits forever")]
    pub timeout_ms: u64,

    /// Re-sends of a timed-out request before giving up
    #[serde(default)]
    #[schemars(range(max = 10))]
    pub max_retries: u32,
}

impl RpcConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: 0,
        }
    }
}

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionConfig {
    /// Largest frame accepted or sent
    #[serde(default)]
    #[schemars(description = "Largest frame accepted or sent. Accepts numbers or strings with a K or M suffix")]
    pub max_frame_size: FrameLimit,

    /// Capacity of the unreliable outbound queue; frames beyond it are dropped
    #[serde(default = "default_unreliable_queue")]
    #[schemars(range(min = 1))]
    pub unreliable_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: FrameLimit::default(),
            unreliable_queue: default_unreliable_queue(),
        }
    }
}

/// Entity pool settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PoolConfig {
    /// Edge length of a spatial grid cell in world units
    #[serde(default = "default_spatial_cell_size")]
    #[schemars(description = "Edge length of a spatial index cell in world units")]
    pub spatial_cell_size: f32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            spatial_cell_size: default_spatial_cell_size(),
        }
    }
}

/// All core settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CoreConfig {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pools: PoolConfig,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_unreliable_queue() -> usize {
    256
}

fn default_spatial_cell_size() -> f32 {
    64.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.rpc.timeout_ms, 10_000);
        assert_eq!(config.rpc.max_retries, 0);
        assert_eq!(config.session.max_frame_size.as_bytes(), 25 * 1024 * 1024);
        assert_eq!(config.session.unreliable_queue, 256);
        assert_eq!(config.pools.spatial_cell_size, 64.0);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config = RpcConfig {
            timeout_ms: 0,
            max_retries: 0,
        };
        assert_eq!(config.timeout(), None);
        assert_eq!(RpcConfig::default().timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_frame_limit_parse() {
        assert_eq!(FrameLimit::parse("1024").unwrap().as_bytes(), 1024);
        assert_eq!(FrameLimit::parse(" 64k ").unwrap().as_bytes(), 64 * 1024);
        assert_eq!(FrameLimit::parse("25M").unwrap().as_bytes(), 25 * 1024 * 1024);

        assert!(FrameLimit::parse("").is_err());
        assert!(FrameLimit::parse("0").is_err());
        assert!(FrameLimit::parse("1G").is_err());
        assert!(FrameLimit::parse("8192M").is_err());
    }

    #[test]
    fn test_frame_limit_in_session_config() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"max_frame_size": 1048576}"#).unwrap();
        assert_eq!(config.max_frame_size.as_bytes(), 1048576);

        let config: SessionConfig = serde_json::from_str(r#"{"max_frame_size": "64K"}"#).unwrap();
        assert_eq!(config.max_frame_size.as_bytes(), 64 * 1024);

        assert!(serde_json::from_str::<SessionConfig>(r#"{"max_frame_size": -1}"#).is_err());
        assert!(serde_json::from_str::<SessionConfig>(r#"{"max_frame_size": 0}"#).is_err());

        let limit = FrameLimit::new(2 * 1024 * 1024).unwrap();
        assert_eq!(serde_json::to_string(&limit).unwrap(), "\"2M\"");
        assert_eq!(FrameLimit::new(500).unwrap().to_string(), "500");
    }
}
