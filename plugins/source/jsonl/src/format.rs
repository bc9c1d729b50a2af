//! On-disk layout: a header line describing topics and schemas, then one
//! line per message, all JSON.
//!
//! ```text
//! {"version":1,"topics":[{"name":"/imu","schema_name":null,"message_encoding":"json"}],"schemas":[]}
//! {"topic":"/imu","time":{"sec":1,"nsec":0},"data":"eyJ4IjoxfQ=="}
//! ```

use bagpipe_api::schema::SchemaDefinition;
use bagpipe_api::time::Time;
use bagpipe_api::topic::Topic;

pub(crate) const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogHeader {
    #[serde(default = "default_version")]
    pub version: u32,
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub schemas: Vec<SchemaDefinition>,
}

fn default_version() -> u32 {
    FORMAT_VERSION
}

impl LogHeader {
    pub fn new(topics: Vec<Topic>, schemas: Vec<SchemaDefinition>) -> Self {
        Self {
            version: FORMAT_VERSION,
            topics,
            schemas,
        }
    }
}

/// One recorded message. `data` is the base64 of the raw payload.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogLine {
    pub topic: String,
    pub time: Time,
    #[serde(with = "bagpipe_api::util::base64_bytes")]
    pub data: Vec<u8>,
}

impl LogLine {
    pub fn new(topic: impl Into<String>, time: Time, data: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            time,
            data: data.into(),
        }
    }
}

/// Render a complete log file.
pub fn render_log(header: &LogHeader, lines: &[LogLine]) -> Result<String, serde_json::Error> {
    let mut out = serde_json::to_string(header)?;
    out.push('\n');
    for line in lines {
        out.push_str(&serde_json::to_string(line)?);
        out.push('\n');
    }
    Ok(out)
}
