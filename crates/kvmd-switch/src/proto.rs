//! Byte-stuffed framed protocol of the daisy-chained switch.
//!
//! Frames are `0xF1 <escaped payload> 0xF2`; inside the body `0xF0` means
//! "XOR the next byte with 0xFF". The payload is a 5-byte header
//! (`proto | rid u16le | op | unit`) followed by an op-specific body.

use crate::types::{Colors, Edid};

pub const FRAME_BEGIN: u8 = 0xF1;
pub const FRAME_END: u8 = 0xF2;
pub const FRAME_ESCAPE: u8 = 0xF0;

pub const PROTO_VERSION: u8 = 1;

pub const OP_NAK: u8 = 0;
pub const OP_BOOTLOADER: u8 = 2;
pub const OP_REBOOT: u8 = 3;
pub const OP_STATE: u8 = 4;
pub const OP_SWITCH: u8 = 5;
pub const OP_BEACON: u8 = 6;
pub const OP_ATX_LEDS: u8 = 7;
pub const OP_ATX_CLICK: u8 = 8;
pub const OP_SET_EDID: u8 = 9;
pub const OP_CLEAR_EDID: u8 = 10;
pub const OP_SET_COLORS: u8 = 12;
pub const OP_SET_QUIRKS: u8 = 13;
pub const OP_SET_DUMMY: u8 = 14;

pub const BROADCAST_UNIT: u8 = 0xFF;

pub const ATX_CLICK_POWER: u8 = 0;
pub const ATX_CLICK_RESET: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub proto: u8,
    pub rid: u16,
    pub op: u8,
    pub unit: u8,
}

impl Header {
    pub const SIZE: usize = 5;

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let rid = self.rid.to_le_bytes();
        [self.proto, rid[0], rid[1], self.op, self.unit]
    }

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            proto: data[0],
            rid: u16::from_le_bytes([data[1], data[2]]),
            op: data[3],
            unit: data[4],
        })
    }
}

pub fn pack_request(rid: u16, op: u8, unit: u8, body: &[u8]) -> Vec<u8> {
    let header = Header {
        proto: PROTO_VERSION,
        rid,
        op,
        unit,
    };
    let mut payload = header.pack().to_vec();
    payload.extend_from_slice(body);
    payload
}

/// Escapes a payload and wraps it into frame delimiters.
pub fn escape_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(FRAME_BEGIN);
    for &byte in payload {
        if (FRAME_ESCAPE..=FRAME_END).contains(&byte) {
            out.push(FRAME_ESCAPE);
            out.push(byte ^ 0xFF);
        } else {
            out.push(byte);
        }
    }
    out.push(FRAME_END);
    out
}

pub fn unescape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut escaped = false;
    for &byte in body {
        if byte == FRAME_ESCAPE {
            escaped = true;
        } else if escaped {
            out.push(byte ^ 0xFF);
            escaped = false;
        } else {
            out.push(byte);
        }
    }
    out
}

/// Pulls complete frames out of a receive buffer, tolerating garbage
/// between them. Incomplete trailing data stays buffered.
pub fn extract_frames(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        let Some(begin) = buf.iter().position(|&byte| byte == FRAME_BEGIN) else {
            buf.clear();
            break;
        };
        let Some(end_rel) = buf[begin..].iter().position(|&byte| byte == FRAME_END) else {
            // Keep the partial frame, drop leading garbage.
            buf.drain(..begin);
            break;
        };
        let end = begin + end_rel;
        let body: Vec<u8> = buf[begin + 1..end].to_vec();
        buf.drain(..=end);
        if body.contains(&FRAME_BEGIN) {
            // Corrupted: a new frame started inside this one.
            continue;
        }
        frames.push(unescape(&body));
    }
    frames
}

// ===== Response bodies.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakReason {
    InvalidCommand,
    Busy,
    NoDownlink,
    DownlinkOverflow,
    Other(u8),
}

impl From<u8> for NakReason {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::InvalidCommand,
            1 => Self::Busy,
            2 => Self::NoDownlink,
            3 => Self::DownlinkOverflow,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitVersion {
    pub hw: u16,
    pub sw: u16,
    pub sw_dev: bool,
}

impl UnitVersion {
    /// Development builds count as always-fresh.
    pub fn is_fresh(&self, version: u16) -> bool {
        self.sw_dev || self.sw >= version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitFlags {
    pub changing_busy: bool,
    pub flashing_busy: bool,
    pub has_downlink: bool,
    pub has_hpd: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitState {
    pub version: UnitVersion,
    pub flags: UnitFlags,
    pub ch: u8,
    pub beacons: [bool; 6],
    pub np_crc: [u16; 6],
    pub video_5v_sens: [bool; 5],
    pub video_hpd: [bool; 5],
    pub video_edid: [bool; 4],
    pub video_crc: [u16; 4],
    pub video_dummies: [bool; 4],
    pub usb_5v_sens: [bool; 4],
    pub atx_busy: [bool; 4],
    pub ignore_hpd: bool,
}

impl UnitState {
    pub const SIZE: usize = 64;

    /// A unit matches a wanted EDID when validity and CRC both agree; any
    /// invalid blob satisfies an invalid want.
    pub fn compare_edid(&self, ch: usize, edid: &Edid) -> bool {
        if !edid.valid {
            return !self.video_edid[ch];
        }
        self.video_edid[ch] == edid.valid && self.video_crc[ch] == edid.crc
    }

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let u16_at = |off: usize| u16::from_le_bytes([data[off], data[off + 1]]);
        let sw_version = u16_at(0);
        let flags = u16_at(4);
        Some(Self {
            version: UnitVersion {
                hw: u16_at(2),
                sw: sw_version & 0x7FFF,
                sw_dev: sw_version & 0x8000 != 0,
            },
            flags: UnitFlags {
                changing_busy: flags & 0x80 != 0,
                flashing_busy: flags & 0x40 != 0,
                has_downlink: flags & 0x02 != 0,
                has_hpd: flags & 0x04 != 0,
            },
            ch: data[6],
            beacons: unpack_flags::<6>(data[7]),
            np_crc: [
                u16_at(8),
                u16_at(10),
                u16_at(12),
                u16_at(14),
                u16_at(16),
                u16_at(18),
            ],
            video_5v_sens: unpack_flags::<5>(data[20]),
            video_hpd: unpack_flags::<5>(data[21]),
            video_edid: unpack_flags::<4>(data[22]),
            video_crc: [u16_at(23), u16_at(25), u16_at(27), u16_at(29)],
            usb_5v_sens: unpack_flags::<4>(data[31]),
            // data[32] is padding.
            atx_busy: unpack_flags::<4>(data[33]),
            ignore_hpd: data[34] & 0x01 != 0,
            video_dummies: unpack_flags::<4>(data[35]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitAtxLeds {
    pub power: [bool; 4],
    pub hdd: [bool; 4],
}

impl UnitAtxLeds {
    pub fn unpack(data: &[u8]) -> Option<Self> {
        let &mask = data.first()?;
        Some(Self {
            power: unpack_flags::<4>(mask),
            hdd: [
                mask & 0x10 != 0,
                mask & 0x20 != 0,
                mask & 0x40 != 0,
                mask & 0x80 != 0,
            ],
        })
    }
}

fn unpack_flags<const N: usize>(mask: u8) -> [bool; N] {
    std::array::from_fn(|bit| mask & (1 << bit) != 0)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Nak(NakReason),
    State(Box<UnitState>),
    AtxLeds(UnitAtxLeds),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub header: Header,
    pub body: ResponseBody,
}

impl Response {
    /// `None` for unknown ops or truncated payloads.
    pub fn unpack(payload: &[u8]) -> Option<Self> {
        let header = Header::unpack(payload)?;
        let body = &payload[Header::SIZE..];
        let body = match header.op {
            OP_NAK => ResponseBody::Nak(NakReason::from(*body.first()?)),
            OP_STATE => ResponseBody::State(Box::new(UnitState::unpack(body)?)),
            OP_ATX_LEDS => ResponseBody::AtxLeds(UnitAtxLeds::unpack(body)?),
            _ => return None,
        };
        Some(Self { header, body })
    }
}

// ===== Request bodies.

pub fn body_switch(ch: u8) -> Vec<u8> {
    debug_assert!(ch <= 4);
    vec![ch]
}

pub fn body_set_beacon(ch: u8, on: bool) -> Vec<u8> {
    debug_assert!(ch <= 5);
    vec![ch, u8::from(on)]
}

pub fn body_atx_click(ch: u8, action: u8, delay_ms: u16) -> Vec<u8> {
    debug_assert!(ch <= 3);
    let delay = delay_ms.to_le_bytes();
    vec![ch, action, delay[0], delay[1]]
}

pub fn body_set_edid(ch: u8, edid: &Edid) -> Vec<u8> {
    debug_assert!(ch <= 3);
    let mut body = Vec::with_capacity(257);
    body.push(ch);
    body.extend_from_slice(edid.pack());
    body
}

pub fn body_clear_edid(ch: u8) -> Vec<u8> {
    debug_assert!(ch <= 3);
    vec![ch]
}

pub fn body_set_dummy(ch: u8, on: bool) -> Vec<u8> {
    debug_assert!(ch <= 3);
    vec![ch, u8::from(on)]
}

pub fn body_set_colors(np: u8, colors: &Colors) -> Vec<u8> {
    debug_assert!(np <= 5);
    let mut body = Vec::with_capacity(31);
    body.push(np);
    body.extend_from_slice(&colors.pack());
    body
}

pub fn body_set_quirks(ignore_hpd: bool) -> Vec<u8> {
    vec![u8::from(ignore_hpd)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_round_trip() {
        let header = Header {
            proto: 1,
            rid: 0xBEEF,
            op: OP_SWITCH,
            unit: 2,
        };
        assert_eq!(Header::unpack(&header.pack()), Some(header));
    }

    proptest! {
        #[test]
        fn escape_round_trips(payload in proptest::collection::vec(any::<u8>(), 0..300)) {
            let framed = escape_frame(&payload);
            prop_assert_eq!(framed[0], FRAME_BEGIN);
            prop_assert_eq!(*framed.last().unwrap(), FRAME_END);
            // No raw delimiters inside the body.
            let body = &framed[1..framed.len() - 1];
            let mut escaped = false;
            for &byte in body {
                if escaped {
                    escaped = false;
                    continue;
                }
                prop_assert!(byte != FRAME_BEGIN && byte != FRAME_END);
                if byte == FRAME_ESCAPE {
                    escaped = true;
                }
            }
            prop_assert_eq!(unescape(body), payload);
        }

        #[test]
        fn extract_recovers_frames_from_garbage(
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            garbage in proptest::collection::vec(0u8..0xF0, 0..16),
        ) {
            let mut buf = garbage.clone();
            buf.extend_from_slice(&escape_frame(&payload));
            let frames = extract_frames(&mut buf);
            prop_assert_eq!(frames, vec![payload]);
            prop_assert!(buf.is_empty());
        }
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let payload = vec![1u8, 2, 3];
        let mut framed = escape_frame(&payload);
        framed.pop(); // Strip the end delimiter.
        let mut buf = framed.clone();
        assert!(extract_frames(&mut buf).is_empty());
        buf.push(FRAME_END);
        assert_eq!(extract_frames(&mut buf), vec![payload]);
    }

    #[test]
    fn unit_state_unpack() {
        let mut raw = vec![0u8; UnitState::SIZE];
        raw[0..2].copy_from_slice(&(7u16 | 0x8000).to_le_bytes()); // sw 7, dev
        raw[2..4].copy_from_slice(&3u16.to_le_bytes()); // hw
        raw[4..6].copy_from_slice(&(0x80u16 | 0x02).to_le_bytes()); // changing busy + downlink
        raw[6] = 2; // active channel
        raw[7] = 0b10_0001; // beacons: port 0 + uplink
        raw[8..10].copy_from_slice(&0x1234u16.to_le_bytes()); // np_crc[0]
        raw[22] = 0b0001; // edid valid on ch 0
        raw[23..25].copy_from_slice(&0xAAAAu16.to_le_bytes()); // video_crc[0]
        raw[33] = 0b0010; // atx busy ch 1
        raw[34] = 0x01; // ignore_hpd

        let state = UnitState::unpack(&raw).unwrap();
        assert_eq!(state.version.sw, 7);
        assert!(state.version.sw_dev);
        assert!(state.version.is_fresh(100));
        assert!(state.flags.changing_busy);
        assert!(state.flags.has_downlink);
        assert_eq!(state.ch, 2);
        assert!(state.beacons[0] && state.beacons[5]);
        assert_eq!(state.np_crc[0], 0x1234);
        assert!(state.video_edid[0]);
        assert_eq!(state.video_crc[0], 0xAAAA);
        assert!(state.atx_busy[1]);
        assert!(state.ignore_hpd);
    }

    #[test]
    fn atx_leds_unpack() {
        let leds = UnitAtxLeds::unpack(&[0b1001_0110]).unwrap();
        assert_eq!(leds.power, [false, true, true, false]);
        assert_eq!(leds.hdd, [true, false, false, true]);
    }

    #[test]
    fn response_dispatch() {
        let mut payload = Header {
            proto: 1,
            rid: 7,
            op: OP_NAK,
            unit: 0,
        }
        .pack()
        .to_vec();
        payload.push(1);
        let response = Response::unpack(&payload).unwrap();
        assert_eq!(response.body, ResponseBody::Nak(NakReason::Busy));

        payload[3] = 0x77; // unknown op
        assert!(Response::unpack(&payload).is_none());
    }

    #[test]
    fn edid_body_is_ch_plus_256() {
        let edid = crate::types::Edid::empty("x");
        let body = body_set_edid(1, &edid);
        assert_eq!(body.len(), 257);
        assert_eq!(body[0], 1);
    }
}
