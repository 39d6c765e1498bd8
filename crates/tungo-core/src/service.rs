//! Service frames: control messages carried inside the encrypted data plane.
//!
//! After decryption a frame's plaintext is either an IP packet bound for the
//! TUN, or a service frame recognised by the `0xFF 0x01` magic prefix (0xF is
//! not a valid IP version nibble, so the spaces cannot collide). Packets
//! addressed to the documentation ranges are likewise diverted to the service
//! handler and never forwarded.

use ipnet::IpNet;

use crate::ip::IpHeader;

/// Magic prefix of every service frame.
pub const SERVICE_MAGIC: [u8; 2] = [0xFF, 0x01];

/// Fixed sizes.
const HEADER_LEN: usize = 3;
const EPHEMERAL_LEN: usize = 32;
const SIZE_LEN: usize = 2;

/// Documentation / TEST-NET ranges that divert to the service handler.
#[must_use]
pub fn doc_ranges() -> Vec<IpNet> {
    [
        "192.0.2.0/24",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "2001:db8::/32",
    ]
    .iter()
    .map(|s| s.parse().expect("static ranges parse"))
    .collect()
}

/// Is this inner destination inside the documentation ranges?
#[must_use]
pub fn is_doc_addressed(header: &IpHeader, ranges: &[IpNet]) -> bool {
    ranges.iter().any(|net| net.contains(&header.dst))
}

/// A decoded service frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceFrame {
    /// Keepalive request.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Start an epoch rotation; carries the initiator's fresh ephemeral.
    RekeyInit {
        /// New X25519 public key.
        ephemeral: [u8; 32],
    },
    /// Answer a rotation; carries the responder's fresh ephemeral.
    RekeyAck {
        /// New X25519 public key.
        ephemeral: [u8; 32],
    },
    /// The sender can no longer rotate; the session is ending.
    EpochExhausted,
    /// Path-MTU probe padded to the probed size.
    MtuProbe {
        /// Probed frame size.
        size: u16,
    },
    /// Echo of a successful probe.
    MtuAck {
        /// The size that arrived intact.
        size: u16,
    },
}

impl ServiceFrame {
    fn type_byte(&self) -> u8 {
        match self {
            Self::Ping => 1,
            Self::Pong => 2,
            Self::RekeyInit { .. } => 3,
            Self::RekeyAck { .. } => 4,
            Self::EpochExhausted => 5,
            Self::MtuProbe { .. } => 6,
            Self::MtuAck { .. } => 7,
        }
    }

    /// Encode to plaintext bytes ready for sealing.
    ///
    /// An `MtuProbe` is padded with zeros so the whole plaintext is exactly
    /// `size` bytes; every other frame is minimal.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + EPHEMERAL_LEN);
        out.extend_from_slice(&SERVICE_MAGIC);
        out.push(self.type_byte());
        match self {
            Self::Ping | Self::Pong | Self::EpochExhausted => {}
            Self::RekeyInit { ephemeral } | Self::RekeyAck { ephemeral } => {
                out.extend_from_slice(ephemeral);
            }
            Self::MtuProbe { size } => {
                out.extend_from_slice(&size.to_be_bytes());
                let target = (*size as usize).max(out.len());
                out.resize(target, 0);
            }
            Self::MtuAck { size } => {
                out.extend_from_slice(&size.to_be_bytes());
            }
        }
        out
    }

    /// Decode a plaintext that starts with the service magic.
    ///
    /// Returns `None` when the magic is absent (an ordinary IP packet), and
    /// `Some(None)` for a magic-prefixed frame that fails to decode.
    #[must_use]
    pub fn decode(plaintext: &[u8]) -> Option<Option<Self>> {
        if plaintext.len() < HEADER_LEN || plaintext[..2] != SERVICE_MAGIC {
            return None;
        }
        let body = &plaintext[HEADER_LEN..];
        let frame = match plaintext[2] {
            1 => Some(Self::Ping),
            2 => Some(Self::Pong),
            3 => ephemeral_of(body).map(|ephemeral| Self::RekeyInit { ephemeral }),
            4 => ephemeral_of(body).map(|ephemeral| Self::RekeyAck { ephemeral }),
            5 => Some(Self::EpochExhausted),
            6 => size_of(body).map(|size| Self::MtuProbe { size }),
            7 => size_of(body).map(|size| Self::MtuAck { size }),
            _ => None,
        };
        Some(frame)
    }
}

fn ephemeral_of(body: &[u8]) -> Option<[u8; 32]> {
    if body.len() < EPHEMERAL_LEN {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&body[..EPHEMERAL_LEN]);
    Some(out)
}

fn size_of(body: &[u8]) -> Option<u16> {
    if body.len() < SIZE_LEN {
        return None;
    }
    Some(u16::from_be_bytes([body[0], body[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn simple_frames_roundtrip() {
        for frame in [
            ServiceFrame::Ping,
            ServiceFrame::Pong,
            ServiceFrame::EpochExhausted,
            ServiceFrame::RekeyInit { ephemeral: [7; 32] },
            ServiceFrame::RekeyAck { ephemeral: [9; 32] },
            ServiceFrame::MtuAck { size: 1380 },
        ] {
            let bytes = frame.encode();
            assert_eq!(ServiceFrame::decode(&bytes), Some(Some(frame)));
        }
    }

    #[test]
    fn probe_pads_to_size() {
        let frame = ServiceFrame::MtuProbe { size: 512 };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), 512);
        assert_eq!(ServiceFrame::decode(&bytes), Some(Some(frame)));
    }

    #[test]
    fn non_magic_is_not_service() {
        let packet = crate::ip::v4_packet(
            Ipv4Addr::new(10, 8, 0, 2),
            Ipv4Addr::new(10, 8, 0, 1),
            b"data",
        );
        assert_eq!(ServiceFrame::decode(&packet), None);
    }

    #[test]
    fn magic_with_bad_body_decodes_to_none() {
        let mut bytes = SERVICE_MAGIC.to_vec();
        bytes.push(3); // RekeyInit with no key
        assert_eq!(ServiceFrame::decode(&bytes), Some(None));

        let mut bytes = SERVICE_MAGIC.to_vec();
        bytes.push(42); // unknown type
        assert_eq!(ServiceFrame::decode(&bytes), Some(None));
    }

    #[test]
    fn doc_range_detection() {
        let ranges = doc_ranges();
        let diverted = crate::ip::v4_packet(
            Ipv4Addr::new(10, 8, 0, 2),
            Ipv4Addr::new(192, 0, 2, 1),
            b"",
        );
        let header = crate::ip::parse(&diverted).unwrap();
        assert!(is_doc_addressed(&header, &ranges));

        let normal = crate::ip::v4_packet(
            Ipv4Addr::new(10, 8, 0, 2),
            Ipv4Addr::new(10, 8, 0, 1),
            b"",
        );
        let header = crate::ip::parse(&normal).unwrap();
        assert!(!is_doc_addressed(&header, &ranges));
    }
}
