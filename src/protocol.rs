//! Tuya datapoint wire protocol.
//! Handles single-frame encoding/decoding, multi-frame reports and the
//! command ids of the manufacturer cluster (0xEF00).

use crate::error::{DecodeError, UnknownFrame};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use serde::{Deserialize, Serialize};

/// Cluster id of the Tuya manufacturer-specific cluster.
pub const TUYA_CLUSTER_ID: u16 = 0xEF00;

/// Size of the `[dpId][dpType][length]` frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Size of the sequence number that prefixes frames in a cluster payload.
pub const ENVELOPE_HEADER_LEN: usize = 2;

define_cluster_commands! {
    DataRequest = 0x00,
    DataResponse = 0x01,
    DataReport = 0x02,
    DataQuery = 0x03,
    ActiveStatusReportAlt = 0x05,
    ActiveStatusReport = 0x06,
    McuVersionRequest = 0x10,
    McuVersionResponse = 0x11,
    TimeSync = 0x24,
    GatewayStatus = 0x25,
}

impl ClusterCommand {
    /// Whether the command carries datapoint frames reported by the device.
    pub fn carries_datapoints(self) -> bool {
        matches!(
            self,
            ClusterCommand::DataResponse
                | ClusterCommand::DataReport
                | ClusterCommand::ActiveStatusReport
                | ClusterCommand::ActiveStatusReportAlt
        )
    }
}

/// Datapoint type tag (byte 1 of every frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DpType {
    Raw = 0x00,
    #[serde(alias = "boolean")]
    Bool = 0x01,
    #[serde(alias = "number")]
    Value = 0x02,
    String = 0x03,
    Enum = 0x04,
    #[serde(alias = "fault")]
    Bitmap = 0x05,
}

impl DpType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(DpType::Raw),
            0x01 => Some(DpType::Bool),
            0x02 => Some(DpType::Value),
            0x03 => Some(DpType::String),
            0x04 => Some(DpType::Enum),
            0x05 => Some(DpType::Bitmap),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Fixed element width, `None` for the variable-length types.
    ///
    /// Bitmap reports the narrowest width; use [`DpType::accepts_width`] to
    /// validate a payload.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            DpType::Bool | DpType::Enum | DpType::Bitmap => Some(1),
            DpType::Value => Some(4),
            DpType::Raw | DpType::String => None,
        }
    }

    pub fn accepts_width(self, len: usize) -> bool {
        match self {
            DpType::Bool | DpType::Enum => len == 1,
            DpType::Value => len == 4,
            DpType::Bitmap => matches!(len, 1 | 2 | 4),
            DpType::Raw | DpType::String => len <= u16::MAX as usize,
        }
    }
}

/// One datapoint as carried on the wire.
///
/// Frames are validated on construction and cannot be mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapointFrame {
    dp_id: u8,
    dp_type: DpType,
    payload: Vec<u8>,
}

impl DatapointFrame {
    pub fn new(dp_id: u8, dp_type: DpType, payload: Vec<u8>) -> Result<Self, DecodeError> {
        if payload.len() > u16::MAX as usize {
            return Err(DecodeError::PayloadTooLong {
                len: payload.len(),
            });
        }
        if !dp_type.accepts_width(payload.len()) {
            return Err(DecodeError::LengthMismatch {
                dp_id,
                dp_type,
                len: payload.len(),
            });
        }
        Ok(Self {
            dp_id,
            dp_type,
            payload,
        })
    }

    pub fn bool(dp_id: u8, value: bool) -> Self {
        Self {
            dp_id,
            dp_type: DpType::Bool,
            payload: vec![value as u8],
        }
    }

    pub fn value(dp_id: u8, value: i32) -> Self {
        Self {
            dp_id,
            dp_type: DpType::Value,
            payload: value.to_be_bytes().to_vec(),
        }
    }

    pub fn enumeration(dp_id: u8, value: u8) -> Self {
        Self {
            dp_id,
            dp_type: DpType::Enum,
            payload: vec![value],
        }
    }

    pub fn dp_id(&self) -> u8 {
        self.dp_id
    }

    pub fn dp_type(&self) -> DpType {
        self.dp_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Size of the encoded frame including its header.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }
}

/// Decode exactly one frame from the start of `data`.
///
/// Bytes after the declared payload are ignored; use [`FrameReader`] for
/// payloads carrying several frames.
pub fn decode(data: &[u8]) -> Result<DatapointFrame, DecodeError> {
    decode_prefix(data).map(|(frame, _)| frame)
}

/// Decode one frame and report how many bytes it occupied.
fn decode_prefix(data: &[u8]) -> Result<(DatapointFrame, usize), DecodeError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::Truncated {
            dp_id: data.first().copied(),
            needed: FRAME_HEADER_LEN,
            available: data.len(),
        });
    }

    let dp_id = data[0];
    let type_tag = data[1];
    let len = BigEndian::read_u16(&data[2..4]) as usize;
    let end = FRAME_HEADER_LEN + len;

    if data.len() < end {
        return Err(DecodeError::Truncated {
            dp_id: Some(dp_id),
            needed: end,
            available: data.len(),
        });
    }
    let payload = data[FRAME_HEADER_LEN..end].to_vec();

    let dp_type = DpType::from_u8(type_tag).ok_or_else(|| {
        DecodeError::UnknownType(UnknownFrame {
            dp_id,
            type_tag,
            payload: payload.clone(),
        })
    })?;

    DatapointFrame::new(dp_id, dp_type, payload).map(|frame| (frame, end))
}

/// Encode a frame. The length field always comes from the actual payload.
pub fn encode(frame: &DatapointFrame) -> Vec<u8> {
    let mut data = Vec::with_capacity(frame.encoded_len());
    data.push(frame.dp_id);
    data.push(frame.dp_type.tag());
    let mut len = [0u8; 2];
    BigEndian::write_u16(&mut len, frame.payload.len() as u16);
    data.extend_from_slice(&len);
    data.extend_from_slice(&frame.payload);
    data
}

/// Iterates over concatenated frames of a multi-DP report.
///
/// Frames with an unknown type or a bad width are yielded as errors and
/// reading resumes after them, since their length is still known. A
/// truncated frame ends the iteration.
pub struct FrameReader<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            done: false,
        }
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Result<DatapointFrame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }

        let rest = &self.data[self.offset..];
        match decode_prefix(rest) {
            Ok((frame, used)) => {
                self.offset += used;
                Some(Ok(frame))
            }
            Err(e @ DecodeError::Truncated { .. }) => {
                self.done = true;
                Some(Err(e))
            }
            Err(e) => {
                // Header was complete, so the declared length can be skipped
                let len = BigEndian::read_u16(&rest[2..4]) as usize;
                self.offset += FRAME_HEADER_LEN + len;
                Some(Err(e))
            }
        }
    }
}

/// Cluster-level payload: a sequence number followed by datapoint frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sequence: u16,
    pub frames: Vec<DatapointFrame>,
}

impl Envelope {
    pub fn new(sequence: u16, frames: Vec<DatapointFrame>) -> Self {
        Self { sequence, frames }
    }

    /// Split a cluster payload into its sequence number and frame region.
    pub fn split(data: &[u8]) -> Result<(u16, &[u8]), DecodeError> {
        if data.len() < ENVELOPE_HEADER_LEN {
            return Err(DecodeError::Truncated {
                dp_id: None,
                needed: ENVELOPE_HEADER_LEN,
                available: data.len(),
            });
        }
        Ok((
            BigEndian::read_u16(&data[..ENVELOPE_HEADER_LEN]),
            &data[ENVELOPE_HEADER_LEN..],
        ))
    }

    /// Strict decode: any bad frame fails the whole envelope.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (sequence, body) = Self::split(data)?;
        let frames = FrameReader::new(body).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sequence, frames })
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len: usize = self.frames.iter().map(|f| f.encoded_len()).sum();
        let mut data = Vec::with_capacity(ENVELOPE_HEADER_LEN + body_len);
        // Writing into a Vec cannot fail
        let _ = data.write_u16::<BigEndian>(self.sequence);
        for frame in &self.frames {
            data.extend_from_slice(&encode(frame));
        }
        data
    }
}
