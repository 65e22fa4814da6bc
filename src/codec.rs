//! Wire codecs for discovery and data packets.
//!
//! Discovery packets are an ASCII header token immediately followed by a
//! JSON body, e.g. `redvypr shortinfo{"host":...}`.  The header is resolved
//! through [`HEADERS`], a fixed dispatch table; no header may be a prefix of
//! another, otherwise the dispatch would be ambiguous.
//!
//! Data packets travel as JSON documents.  Several packets may be batched in
//! one pub/sub payload, separated by the ASCII record separator
//! ([`PACKET_BOUNDARY`]), which JSON never emits unescaped.
//!
//! All input handled here comes from the network and is untrusted: decoding
//! returns a [`DecodeError`] for any malformed input and never panics.

use crate::error::DecodeError;
use crate::types::{DataPacket, HostInfo, HostMessage, InfoPayload};

/// Separator between batched data packets.
pub const PACKET_BOUNDARY: u8 = 0x1e;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    Info,
    InfoShort,
    GetInfo,
    Stop,
}

/// Header token of every discovery packet kind.
pub const HEADERS: [(InfoKind, &[u8]); 4] = [
    (InfoKind::Info, b"redvypr info"),
    (InfoKind::InfoShort, b"redvypr shortinfo"),
    (InfoKind::GetInfo, b"redvypr getinfo"),
    (InfoKind::Stop, b"redvypr stop"),
];

impl InfoKind {
    pub fn header(self) -> &'static [u8] {
        HEADERS
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, header)| *header)
            .unwrap_or_default()
    }

    /// Splits `data` into its kind and body.
    pub fn split(data: &[u8]) -> Result<(InfoKind, &[u8]), DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }
        HEADERS
            .iter()
            .find(|(_, header)| data.starts_with(header))
            .map(|(kind, header)| (*kind, &data[header.len()..]))
            .ok_or(DecodeError::UnknownHeader)
    }
}

/// A decoded discovery packet.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoPacket {
    /// Full info including the device catalogue.
    Info(InfoPayload),
    /// Presence beacon without catalogue.
    InfoShort(InfoPayload),
    /// Request for every host to announce itself.
    GetInfo(HostMessage),
    /// The sending host shuts down.
    Stop(HostMessage),
}

impl InfoPacket {
    pub fn kind(&self) -> InfoKind {
        match self {
            InfoPacket::Info(_) => InfoKind::Info,
            InfoPacket::InfoShort(_) => InfoKind::InfoShort,
            InfoPacket::GetInfo(_) => InfoKind::GetInfo,
            InfoPacket::Stop(_) => InfoKind::Stop,
        }
    }

    /// Host that sent the packet.
    pub fn host(&self) -> &HostInfo {
        match self {
            InfoPacket::Info(p) | InfoPacket::InfoShort(p) => &p.host,
            InfoPacket::GetInfo(m) | InfoPacket::Stop(m) => &m.host,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = match self {
            InfoPacket::Info(p) | InfoPacket::InfoShort(p) => serde_json::to_vec(p),
            InfoPacket::GetInfo(m) | InfoPacket::Stop(m) => serde_json::to_vec(m),
        };
        let mut buf = self.kind().header().to_vec();
        // Serializing these plain structs cannot fail.
        buf.extend(body.unwrap_or_default());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (kind, body) = InfoKind::split(data)?;
        Ok(match kind {
            InfoKind::Info => InfoPacket::Info(serde_json::from_slice(body)?),
            InfoKind::InfoShort => InfoPacket::InfoShort(serde_json::from_slice(body)?),
            InfoKind::GetInfo => InfoPacket::GetInfo(serde_json::from_slice(body)?),
            InfoKind::Stop => InfoPacket::Stop(serde_json::from_slice(body)?),
        })
    }
}

/// Serializes packets into one batched payload.
pub fn encode_batch(packets: &[DataPacket]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    for (i, packet) in packets.iter().enumerate() {
        if i > 0 {
            buf.push(PACKET_BOUNDARY);
        }
        serde_json::to_writer(&mut buf, packet)?;
    }
    Ok(buf)
}

/// Splits a batched payload and decodes every packet independently.
///
/// Empty segments are skipped; a malformed segment yields an error in its
/// slot without affecting the others.
pub fn decode_batch(payload: &[u8]) -> Vec<Result<DataPacket, DecodeError>> {
    payload
        .split(|b| *b == PACKET_BOUNDARY)
        .filter(|segment| !segment.iter().all(u8::is_ascii_whitespace))
        .map(|segment| serde_json::from_slice(segment).map_err(DecodeError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Catalogue;

    fn host() -> HostInfo {
        HostInfo {
            hostname: "hostA".into(),
            addr: "1.2.3.4".into(),
            uuid: "uuidA".into(),
            tstart: 1700000000.5,
        }
    }

    fn info() -> InfoPayload {
        let mut devices = Catalogue::new();
        devices.insert(
            "temp:hostA@1.2.3.4::uuidA".into(),
            serde_json::json!({"unit": "degC"}),
        );
        InfoPayload {
            host: host(),
            zmq_pub_url: "tcp://1.2.3.4:18200".into(),
            zmq_rep_url: "tcp://1.2.3.4:18300".into(),
            tinfo: 1700000001.0,
            devices,
            hostinfo_opt: serde_json::Map::new(),
        }
    }

    #[test]
    fn headers_are_prefix_free() {
        for (a, ha) in HEADERS.iter() {
            for (b, hb) in HEADERS.iter() {
                if a != b {
                    assert!(!ha.starts_with(hb), "{:?} starts with {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn every_kind_round_trips() {
        let packets = [
            InfoPacket::Info(info()),
            InfoPacket::InfoShort(info().short()),
            InfoPacket::GetInfo(HostMessage { host: host() }),
            InfoPacket::Stop(HostMessage { host: host() }),
        ];
        for packet in packets {
            let bytes = packet.encode();
            assert!(bytes.starts_with(packet.kind().header()));
            assert_eq!(InfoPacket::decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn short_info_is_terse() {
        let full = InfoPacket::Info(info()).encode();
        let short = InfoPacket::InfoShort(info().short()).encode();
        assert!(short.len() < full.len());
        assert!(!String::from_utf8_lossy(&short).contains("devices"));
    }

    #[test]
    fn garbage_yields_typed_errors() {
        assert!(matches!(InfoPacket::decode(b""), Err(DecodeError::Empty)));
        assert!(matches!(
            InfoPacket::decode(b"redvypr inf"),
            Err(DecodeError::UnknownHeader)
        ));
        assert!(matches!(
            InfoPacket::decode(b"hello world"),
            Err(DecodeError::UnknownHeader)
        ));
        assert!(matches!(
            InfoPacket::decode(b"redvypr info"),
            Err(DecodeError::Body(_))
        ));
        assert!(matches!(
            InfoPacket::decode(b"redvypr stop{\"host\": 3}"),
            Err(DecodeError::Body(_))
        ));
        assert!(matches!(
            InfoPacket::decode(b"redvypr getinfo\xff\xfe"),
            Err(DecodeError::Body(_))
        ));
    }

    #[test]
    fn every_truncation_fails_cleanly() {
        let bytes = InfoPacket::Info(info()).encode();
        for len in 0..bytes.len() {
            assert!(InfoPacket::decode(&bytes[..len]).is_err(), "len {}", len);
        }
    }

    #[test]
    fn batch_skips_broken_segments() {
        let mut a = DataPacket::new(host(), "temp").with("T", 21.5);
        a.t = 1700000002.25;
        let mut b = DataPacket::new(host(), "pressure").with("p", 1013);
        b.t = 1700000003.75;
        b.numpacket = 7;
        let mut payload = encode_batch(&[a.clone()]).unwrap();
        payload.push(PACKET_BOUNDARY);
        payload.extend_from_slice(b"{not json");
        payload.push(PACKET_BOUNDARY);
        payload.extend(encode_batch(&[b.clone()]).unwrap());
        payload.push(PACKET_BOUNDARY);

        let decoded = decode_batch(&payload);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_ref().unwrap(), &a);
        assert!(decoded[1].is_err());
        assert_eq!(decoded[2].as_ref().unwrap(), &b);
    }

    #[test]
    fn packet_without_host_is_rejected() {
        let decoded = decode_batch(br#"{"device": "temp", "t": 1.0}"#);
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is_err());
    }
}
