//! Wire format shared by the sender and the reader.
//!
//! A session stream starts with one NUL-terminated text description followed
//! by packets. Every packet is a 20-byte big-endian header, `quantity` sample
//! groups and two NUL-terminated strings:
//!
//! ```text
//! kernel u8 | counter_count u8 | core u8 | quantity u8
//! batch u32 | missed u32 | first_index u32 | pid u32
//! quantity × (cycles u32, counter_count × u32)
//! cmdline \0 executable \0
//! ```

mod codec;

use std::fmt::Write as _;

use crate::capture::record::{Sample, NUM_COUNTERS};

pub use codec::{decode_packet, encode_packet, DecodeError, PacketCodec};

/// Fixed packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 20;

/// Largest number of samples one packet carries.
pub const MAX_QUANTITY: u8 = u8::MAX;

/// Number of event descriptions in the session header.
pub const DESCRIPTION_EVENTS: usize = NUM_COUNTERS;

/// Packet header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub kernel: bool,
    pub counter_count: u8,
    pub core: u8,
    pub quantity: u8,
    pub batch: u32,
    pub missed: u32,
    pub first_index: u32,
    pub pid: u32,
}

/// A run of samples sharing core, pid and mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub header: PacketHeader,
    pub samples: Vec<Sample>,
    pub cmdline: String,
    pub executable: String,
}

impl Packet {
    /// Bytes this packet occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_SIZE
            + self.samples.len() * (1 + usize::from(self.header.counter_count)) * 4
            + wire_str_len(&self.cmdline)
            + 1
            + wire_str_len(&self.executable)
            + 1
    }
}

/// Length of `s` as written on the wire (interior NULs are dropped).
pub(crate) fn wire_str_len(s: &str) -> usize {
    s.bytes().filter(|b| *b != 0).count()
}

/// Session description sent ahead of the first packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    text: String,
}

impl SessionDescription {
    /// Formats the capture settings: the period and one line per event
    /// counter. Counters without a configured selector are left blank.
    pub fn from_settings(period: u32, events: &[u32]) -> Self {
        let mut text = String::new();
        let _ = writeln!(text, "period:  {period}");
        for i in 0..DESCRIPTION_EVENTS {
            match events.get(i) {
                Some(v) => {
                    let _ = writeln!(text, "event{}:  {v}", i + 1);
                }
                None => {
                    let _ = writeln!(text, "event{}:  ", i + 1);
                }
            }
        }
        Self { text }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Looks up a `key:  value` line.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.text.lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k == key).then(|| v.trim())
        })
    }
}

/// One item of a decoded session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Description(SessionDescription),
    Packet(Packet),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_format() {
        let d = SessionDescription::from_settings(1_000_000, &[8, 0, 0, 0]);
        assert_eq!(
            d.as_str(),
            "period:  1000000\nevent1:  8\nevent2:  0\nevent3:  0\nevent4:  0\nevent5:  \nevent6:  \n"
        );
        assert_eq!(d.field("period"), Some("1000000"));
        assert_eq!(d.field("event1"), Some("8"));
        assert_eq!(d.field("event6"), Some(""));
        assert_eq!(d.field("event7"), None);
    }

    #[test]
    fn test_encoded_len() {
        let packet = Packet {
            header: PacketHeader {
                counter_count: 6,
                quantity: 2,
                ..PacketHeader::default()
            },
            samples: vec![Sample::default(); 2],
            cmdline: "app".to_string(),
            executable: "/bin/app".to_string(),
        };
        assert_eq!(packet.encoded_len(), 20 + 2 * 7 * 4 + 4 + 9);
    }
}
