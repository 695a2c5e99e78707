use serde::{Deserialize, Serialize};

/// Current push-channel protocol version.  Sent in `Subscribe` so the server
/// can refuse clients speaking an incompatible frame format.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Remote compute endpoint ───────────────────────────────────────────────────

/// Routes of the remote compute service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Map ids for every band of the computed image.
    MapId,
    /// Small chart for a single point, delivered over the push channel.
    Chart,
    /// Export to cloud storage, progress delivered over the push channel.
    Export,
    /// Direct download link, delivered over the push channel.
    Download,
    /// Cancels a running export or deletes exported files.
    Clean,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::MapId => "/mapid",
            Endpoint::Chart => "/chart",
            Endpoint::Export => "/export",
            Endpoint::Download => "/download",
            Endpoint::Clean => "/clean",
        }
    }
}

/// One band of a computed layer as returned by `/mapid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandInfo {
    pub name: String,
    #[serde(default)]
    pub mapid: String,
    #[serde(default)]
    pub token: String,
}

/// Body of a `/mapid` response.  An `error` key wins over `bands`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerResponse {
    Failed { error: String },
    Bands { bands: Vec<BandInfo> },
}

/// Body of a chart/export/download/clean response.  Success carries no
/// payload; the server may answer with an empty body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

// ── Push channel ─────────────────────────────────────────────────────────────

/// A server-initiated notification for the alert board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub id: String,
    pub style: String,
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
}

/// Largest frame body accepted from the wire.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Frames exchanged over the push-channel socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame")]
pub enum Frame {
    /// Client → server, sent once right after connecting.
    Subscribe {
        client_id: String,
        protocol_version: u32,
    },
    /// Server → client.
    Alert(AlertMessage),
}

impl Frame {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`.  Returns `Ok(None)` when
    /// the buffer does not yet hold a complete frame.
    pub fn decode(data: &[u8]) -> anyhow::Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("frame of {} bytes exceeds {} byte limit", len, MAX_FRAME_LEN);
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        let frame: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok(Some((frame, 4 + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_response_bands() {
        let body = r#"{"bands":[{"name":"slope","mapid":"m1","token":"t1"},{"name":"intercept"}]}"#;
        let parsed: LayerResponse = serde_json::from_str(body).unwrap();
        match parsed {
            LayerResponse::Bands { bands } => {
                assert_eq!(bands.len(), 2);
                assert_eq!(bands[0].mapid, "m1");
                assert_eq!(bands[1].name, "intercept");
                assert!(bands[1].token.is_empty());
            }
            other => panic!("expected bands, got {:?}", other),
        }
    }

    #[test]
    fn test_layer_response_error() {
        let parsed: LayerResponse = serde_json::from_str(r#"{"error":"quota exceeded"}"#).unwrap();
        assert_eq!(
            parsed,
            LayerResponse::Failed {
                error: "quota exceeded".to_string()
            }
        );
    }

    #[test]
    fn test_alert_frame_wire_shape() {
        let frame = Frame::Alert(AlertMessage {
            id: "layer-ndvi".to_string(),
            style: "warning".to_string(),
            line1: "3 tiles remaining.".to_string(),
            line2: None,
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["frame"], "Alert");
        assert_eq!(json["id"], "layer-ndvi");
        assert!(json.get("line2").is_none());
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let frame = Frame::Subscribe {
            client_id: "1700000000ABC123".to_string(),
            protocol_version: PROTOCOL_VERSION,
        };
        let encoded = frame.encode().unwrap();
        assert!(Frame::decode(&encoded[..3]).unwrap().is_none());
        assert!(Frame::decode(&encoded[..encoded.len() - 1]).unwrap().is_none());

        let mut two = encoded.clone();
        two.extend_from_slice(&encoded);
        let (decoded, consumed) = Frame::decode(&two).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut data = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(b"{\"frame\"");
        assert!(Frame::decode(&data).is_err());
    }
}
