//! Wire encoding for snapshots.
//!
//! Body: a JSON object carrying `schema` and `version` next to the snapshot fields,
//! zlib-compressed when compression is enabled. The `X-Payload-Encoding` header says
//! which.
//!
//! ```json
//! {"schema":"crowdwatch.snapshot","version":1,"source_id":"lobby","seq":40,
//!  "timestamp":1700000000000,"count":8,"density":"medium","trend":"stable",
//!  "anomaly":false,"processing_ms":31,"detections":[{"x":0.1,"y":0.2,"w":0.05,"h":0.2,"confidence":0.91}]}
//! ```

use anyhow::{anyhow, Context, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use std::io::{Read, Write};

use crate::aggregate::CrowdSnapshot;

pub const SCHEMA: &str = "crowdwatch.snapshot";
pub const SCHEMA_VERSION: u32 = 1;

/// Upper bound on a decompressed body, to keep a corrupt spool entry from ballooning.
const MAX_DECODED_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadEncoding {
    Zlib,
    Identity,
}

impl PayloadEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadEncoding::Zlib => "zlib",
            PayloadEncoding::Identity => "identity",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "zlib" => Ok(PayloadEncoding::Zlib),
            "identity" => Ok(PayloadEncoding::Identity),
            other => Err(anyhow!("unknown payload encoding '{}'", other)),
        }
    }
}

/// Encoded request body, ready to send or spool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedPayload {
    pub body: Vec<u8>,
    pub encoding: PayloadEncoding,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    schema: &'static str,
    version: u32,
    #[serde(flatten)]
    snapshot: &'a CrowdSnapshot,
}

pub fn encode(snapshot: &CrowdSnapshot, compress: bool) -> Result<EncodedPayload> {
    let json = serde_json::to_vec(&WireEnvelope {
        schema: SCHEMA,
        version: SCHEMA_VERSION,
        snapshot,
    })
    .context("serialize snapshot")?;

    if !compress {
        return Ok(EncodedPayload {
            body: json,
            encoding: PayloadEncoding::Identity,
        });
    }
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json).context("compress snapshot")?;
    Ok(EncodedPayload {
        body: encoder.finish().context("finish zlib stream")?,
        encoding: PayloadEncoding::Zlib,
    })
}

pub fn decode(body: &[u8], encoding: PayloadEncoding) -> Result<CrowdSnapshot> {
    let json = match encoding {
        PayloadEncoding::Identity => body.to_vec(),
        PayloadEncoding::Zlib => {
            let mut out = Vec::new();
            ZlibDecoder::new(body)
                .take(MAX_DECODED_BYTES)
                .read_to_end(&mut out)
                .context("decompress payload")?;
            out
        }
    };

    let value: serde_json::Value = serde_json::from_slice(&json).context("parse payload json")?;
    let schema = value.get("schema").and_then(|v| v.as_str());
    if schema != Some(SCHEMA) {
        return Err(anyhow!("unexpected payload schema {:?}", schema));
    }
    let version = value.get("version").and_then(|v| v.as_u64());
    if version != Some(SCHEMA_VERSION as u64) {
        return Err(anyhow!("unsupported payload version {:?}", version));
    }
    serde_json::from_value(value).context("decode snapshot fields")
}
