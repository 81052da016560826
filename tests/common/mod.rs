#![allow(dead_code)]

use em340_bridge::capture::ByteEvent;
use em340_bridge::modbus::crc::{crc16, crc_to_wire};
pub use em340_bridge::prelude::*;

use std::collections::VecDeque;
use std::io::Read;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn with_crc(frame: &[u8]) -> Vec<u8> {
    [frame, &crc_to_wire(crc16(frame))[..]].concat()
}

pub struct Factory;

impl Factory {
    pub fn entry(id: &str, address: u16, value_type: &str, multiply: f64) -> RegisterSchemaEntry {
        RegisterSchemaEntry {
            id: id.to_string(),
            name: id.to_string(),
            address,
            value_type: value_type.to_string(),
            multiply,
            unit: String::new(),
            skip: false,
        }
    }

    // a slice of the EM340 register map
    pub fn schema() -> RegisterSchema {
        RegisterSchema::new(vec![
            Self::entry("v_l1_n", 0x0000, "INT32", 0.1),
            Self::entry("v_l2_n", 0x0002, "INT32", 0.1),
            Self::entry("v_l3_n", 0x0004, "INT32", 0.1),
            Self::entry("a_l1", 0x000c, "INT32", 0.001),
            Self::entry("w_l1", 0x0012, "INT32", 0.1),
            Self::entry("w_l2", 0x0014, "INT32", 0.1),
            Self::entry("kwh_plus_tot", 0x0034, "INT64", 0.1),
            Self::entry("kwh_neg_tot", 0x004e, "INT64", 0.1),
        ])
    }

    pub fn read_request(slave: u8, address: u16, count: u16) -> Vec<u8> {
        let [a_hi, a_lo] = address.to_be_bytes();
        let [c_hi, c_lo] = count.to_be_bytes();
        with_crc(&[slave, 3, a_hi, a_lo, c_hi, c_lo])
    }

    pub fn read_reply(slave: u8, words: &[u16]) -> Vec<u8> {
        let mut frame = vec![slave, 3, (words.len() * 2) as u8];
        for word in words {
            frame.extend_from_slice(&word.to_be_bytes());
        }
        with_crc(&frame)
    }
}

/// Builds a timed byte stream the way it would come off the wire.
pub struct Bus {
    now: Instant,
    events: Vec<ByteEvent>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub const SILENCE: Duration = Duration::from_millis(10);
    pub const BYTE_TIME: Duration = Duration::from_millis(1);

    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            events: Vec::new(),
        }
    }

    /// An empty bus that carries on from where this one ended.
    pub fn then(&self) -> Self {
        Self {
            now: self.now,
            events: Vec::new(),
        }
    }

    /// A frame preceded by a line silence.
    pub fn frame(self, bytes: &[u8]) -> Self {
        self.frame_spaced(Self::SILENCE, Self::BYTE_TIME, bytes)
    }

    /// Bytes sent `spacing` apart, the first one `lead` after the previous byte.
    pub fn frame_spaced(mut self, lead: Duration, spacing: Duration, bytes: &[u8]) -> Self {
        for (i, byte) in bytes.iter().enumerate() {
            self.now += if i == 0 { lead } else { spacing };
            self.events.push(ByteEvent::new(self.now, *byte));
        }
        self
    }

    /// A read request followed by its reply.
    pub fn transaction(self, slave: u8, address: u16, words: &[u16]) -> Self {
        self.frame(&Factory::read_request(slave, address, words.len() as u16))
            .frame(&Factory::read_reply(slave, words))
    }

    pub fn events(&self) -> Vec<ByteEvent> {
        self.events.clone()
    }

    pub fn feed(&self, parser: &mut em340_bridge::modbus::TransactionParser) -> Vec<DecodedReading> {
        self.events.iter().filter_map(|event| parser.feed(*event)).collect()
    }
}

/// Hands out one frame per read with a silence before each, then reports EOF.
pub struct FramedReader {
    frames: VecDeque<Vec<u8>>,
    // the front frame has been partly handed out already
    mid_frame: bool,
}

impl FramedReader {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames: frames.into(),
            mid_frame: false,
        }
    }
}

impl Read for FramedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(frame) = self.frames.pop_front() else {
            return Ok(0);
        };

        if !self.mid_frame {
            std::thread::sleep(Bus::SILENCE);
        }
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        self.mid_frame = n < frame.len();
        if self.mid_frame {
            self.frames.push_front(frame[n..].to_vec());
        }
        Ok(n)
    }
}
