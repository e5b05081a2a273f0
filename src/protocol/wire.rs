use bytes::{Buf, BufMut, BytesMut};

use crate::config::RECV_ACK_INT;

//
// Bond-side packet types (2-byte big-endian header). REG3 and KEEPALIVE share
//  a type value; they are told apart by length and direction - REG3 only ever
//  travels receiver -> client as a bare 2-byte reply.
//
pub const SRTLA_TYPE_REG1: u16 = 0x9000;
pub const SRTLA_TYPE_REG2: u16 = 0x9001;
pub const SRTLA_TYPE_REG3: u16 = 0x9002;
pub const SRTLA_TYPE_KEEPALIVE: u16 = 0x9002;
pub const SRTLA_TYPE_ACK: u16 = 0x9100;
pub const SRTLA_TYPE_REG_ERR: u16 = 0x9100;
pub const SRTLA_TYPE_REG_NGP: u16 = 0x9101;

// SRT control types, as seen in the first two bytes of passthrough traffic.
pub const SRT_TYPE_HANDSHAKE: u16 = 0x8000;
pub const SRT_TYPE_ACK: u16 = 0x8002;
pub const SRT_TYPE_NAK: u16 = 0x8003;

pub const SRTLA_ID_LEN: usize = 32;
pub const SRTLA_TYPE_REG1_LEN: usize = 258;
pub const SRTLA_TYPE_REG2_LEN: usize = 2 + SRTLA_ID_LEN;
pub const SRTLA_KEEPALIVE_BARE_LEN: usize = 2;
pub const SRTLA_KEEPALIVE_EXT_LEN: usize = 42;
pub const SRTLA_KEEPALIVE_MAGIC: u16 = 0xFEED;
pub const SRTLA_KEEPALIVE_EXT_VERSION: u16 = 0x0001;
pub const SRTLA_ACK_LEN: usize = 4 + 4 * RECV_ACK_INT;

/// Anything shorter than this is not a well-formed SRT packet and is dropped
///  on the data path.
pub const SRT_MIN_LEN: usize = 16;
pub const MTU: usize = 1500;

pub fn packet_type(buf: &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

pub fn is_reg1(buf: &[u8]) -> bool {
    buf.len() == SRTLA_TYPE_REG1_LEN && packet_type(buf) == Some(SRTLA_TYPE_REG1)
}

pub fn is_reg2(buf: &[u8]) -> bool {
    buf.len() == SRTLA_TYPE_REG2_LEN && packet_type(buf) == Some(SRTLA_TYPE_REG2)
}

pub fn is_keepalive(buf: &[u8]) -> bool {
    packet_type(buf) == Some(SRTLA_TYPE_KEEPALIVE)
}

pub fn is_srt_ack(buf: &[u8]) -> bool {
    packet_type(buf) == Some(SRT_TYPE_ACK)
}

pub fn is_srt_nak(buf: &[u8]) -> bool {
    buf.len() >= SRT_MIN_LEN && packet_type(buf) == Some(SRT_TYPE_NAK)
}

/// Extract the SRT sequence number from a data packet. Data packets carry the
///  sequence number in the first 32-bit word with the most significant bit
///  clear; control packets have it set and yield `None`.
pub fn srt_sequence_number(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    let sn = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if sn & (1 << 31) == 0 {
        Some(sn)
    } else {
        None
    }
}

/// Sender telemetry carried in an extended keepalive.
///
/// The wire encodes the round-trip time in microseconds; it is converted to
///  milliseconds here so that everything downstream works in the same unit as
///  the quality thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderTelemetry {
    pub conn_id: u32,
    pub window: i32,
    pub in_flight: i32,
    pub rtt_ms: u32,
    pub nak_count: u32,
    pub bitrate_bytes_per_sec: u32,
}

/// Parse the telemetry block out of an extended keepalive.
///
/// Returns `None` for bare keepalives and for any datagram whose magic or
///  version does not match - callers fall back to treating it as a bare
///  keepalive in that case.
pub fn parse_keepalive_telemetry(buf: &[u8]) -> Option<SenderTelemetry> {
    if buf.len() < SRTLA_KEEPALIVE_EXT_LEN || packet_type(buf)? != SRTLA_TYPE_KEEPALIVE {
        return None;
    }

    let mut b = &buf[2..];
    let _opaque = b.get_u64(); // echoed, no meaning to the receiver
    if b.get_u16() != SRTLA_KEEPALIVE_MAGIC {
        return None;
    }
    if b.get_u16() != SRTLA_KEEPALIVE_EXT_VERSION {
        return None;
    }

    let conn_id = b.get_u32();
    let window = b.get_i32();
    let in_flight = b.get_i32();
    let rtt_us = b.get_u64();
    let nak_count = b.get_u32();
    let bitrate_bytes_per_sec = b.get_u32();

    Some(SenderTelemetry {
        conn_id,
        window,
        in_flight,
        rtt_ms: u32::try_from(rtt_us / 1000).unwrap_or(u32::MAX),
        nak_count,
        bitrate_bytes_per_sec,
    })
}

/// Encode a batched ACK: the type in the upper half of the first 32-bit word,
///  followed by the ten most recent sequence numbers in arrival order.
pub fn encode_ack(sequence_numbers: &[u32; RECV_ACK_INT]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SRTLA_ACK_LEN);
    buf.put_u32(u32::from(SRTLA_TYPE_ACK) << 16);
    for sn in sequence_numbers {
        buf.put_u32(*sn);
    }
    buf
}

/// Encode a REG2 reply carrying the full group id.
pub fn encode_reg2(id: &[u8; SRTLA_ID_LEN]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SRTLA_TYPE_REG2_LEN);
    buf.put_u16(SRTLA_TYPE_REG2);
    buf.put_slice(id);
    buf
}

/// Encode one of the bare 2-byte packets (REG3, REG_ERR, REG_NGP, keepalive).
pub fn encode_bare(packet_type: u16) -> [u8; 2] {
    packet_type.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use rstest::*;
    use super::*;

    fn ext_keepalive() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(SRTLA_TYPE_KEEPALIVE);
        buf.put_u64(0xdead_beef_cafe_f00d); // opaque
        buf.put_u16(SRTLA_KEEPALIVE_MAGIC);
        buf.put_u16(SRTLA_KEEPALIVE_EXT_VERSION);
        buf.put_u32(7); // conn_id
        buf.put_i32(8192); // window
        buf.put_i32(4096); // in_flight
        buf.put_u64(150_000); // rtt in us
        buf.put_u32(12); // nak_count
        buf.put_u32(625_000); // bitrate bytes/s
        buf.to_vec()
    }

    #[test]
    fn test_classification_by_type_and_length() {
        let mut reg1 = vec![0u8; SRTLA_TYPE_REG1_LEN];
        reg1[0] = 0x90;
        assert!(is_reg1(&reg1));
        assert!(!is_reg2(&reg1));
        // wrong length is not REG1
        assert!(!is_reg1(&reg1[..200]));

        let mut reg2 = vec![0u8; SRTLA_TYPE_REG2_LEN];
        reg2[0] = 0x90;
        reg2[1] = 0x01;
        assert!(is_reg2(&reg2));
        assert!(!is_reg1(&reg2));

        assert!(is_keepalive(&encode_bare(SRTLA_TYPE_KEEPALIVE)));
        assert!(is_keepalive(&ext_keepalive()));
        assert!(is_srt_ack(&[0x80, 0x02, 0, 0]));
        assert!(is_srt_nak(&[0x80u8, 0x03, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]));
        assert!(!is_srt_nak(&[0x80, 0x03, 0, 0])); // below SRT_MIN_LEN
        assert_eq!(packet_type(&[0x90]), None);
    }

    #[test]
    fn test_srt_sequence_number() {
        assert_eq!(srt_sequence_number(&[0x00, 0x00, 0x00, 0x2a]), Some(42));
        assert_eq!(srt_sequence_number(&[0x7f, 0xff, 0xff, 0xff]), Some(0x7fff_ffff));
        // control bit set
        assert_eq!(srt_sequence_number(&[0x80, 0x02, 0x00, 0x00]), None);
        assert_eq!(srt_sequence_number(&[0x00, 0x00]), None);
    }

    #[test]
    fn test_parse_keepalive_telemetry() {
        let telemetry = parse_keepalive_telemetry(&ext_keepalive()).unwrap();
        assert_eq!(
            telemetry,
            SenderTelemetry {
                conn_id: 7,
                window: 8192,
                in_flight: 4096,
                rtt_ms: 150,
                nak_count: 12,
                bitrate_bytes_per_sec: 625_000,
            }
        );
    }

    #[rstest]
    #[case::bare(encode_bare(SRTLA_TYPE_KEEPALIVE).to_vec())]
    #[case::truncated(ext_keepalive()[..SRTLA_KEEPALIVE_EXT_LEN - 1].to_vec())]
    #[case::bad_magic({ let mut b = ext_keepalive(); b[10] = 0x00; b })]
    #[case::bad_version({ let mut b = ext_keepalive(); b[13] = 0x02; b })]
    fn test_parse_keepalive_telemetry_rejects(#[case] buf: Vec<u8>) {
        assert_eq!(parse_keepalive_telemetry(&buf), None);
    }

    #[test]
    fn test_rtt_microseconds_are_converted_to_ms() {
        let mut buf = ext_keepalive();
        buf[26..34].copy_from_slice(&999u64.to_be_bytes());
        assert_eq!(parse_keepalive_telemetry(&buf).unwrap().rtt_ms, 0);

        buf[26..34].copy_from_slice(&2_500_000u64.to_be_bytes());
        assert_eq!(parse_keepalive_telemetry(&buf).unwrap().rtt_ms, 2500);
    }

    #[test]
    fn test_encode_ack() {
        let ack = encode_ack(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(ack.len(), SRTLA_ACK_LEN);
        assert_eq!(&ack[..4], &[0x91, 0x00, 0x00, 0x00]);
        for (i, chunk) in ack[4..].chunks(4).enumerate() {
            assert_eq!(chunk, (i as u32 + 1).to_be_bytes());
        }
    }

    #[test]
    fn test_encode_reg2() {
        let id = [0xabu8; SRTLA_ID_LEN];
        let reg2 = encode_reg2(&id);
        assert_eq!(reg2.len(), SRTLA_TYPE_REG2_LEN);
        assert!(is_reg2(&reg2));
        assert_eq!(&reg2[2..], &id);
    }
}
