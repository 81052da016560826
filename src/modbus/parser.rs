use crate::prelude::*;

use super::crc::{crc16_parts, crc_from_wire};
use super::frame::{RequestHeader, MAX_ADU_LEN, REQUEST_LEN};

/// Default silence that separates two RTU frames at 9600 baud.
pub const DEFAULT_FRAME_GAP: Duration = Duration::from_millis(4);

// request (8 bytes) plus the first byte of the reply
const SYNC_LEN: usize = REQUEST_LEN + 1;

const EXCEPTION_BIT: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserState {
    AwaitingMasterRequest,
    ReadingFunctionCode,
    ReadingByteCount,
    ReadingData,
    ReadingCrcHigh,
    ReadingCrcLow,
}

/// Everything known about the request/response pair being followed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionContext {
    pub slave_address: u8,
    pub function_code: u8,
    pub register_address: u16,
    pub register_count: u16,
    pub expected_byte_count: usize,
    pub payload: Vec<u8>,
    // first CRC byte on the wire, the low-order half
    pub crc_high: u8,
    pub crc_low: u8,
}

impl TransactionContext {
    fn begin(&mut self, header: &RequestHeader) {
        self.reset();
        self.slave_address = header.slave_address;
        self.function_code = header.function_code;
        self.register_address = header.register_address;
        self.register_count = header.register_count;
        self.expected_byte_count = header.expected_byte_count();
    }

    /// Clear all fields, keeping the payload allocation.
    pub fn reset(&mut self) {
        self.slave_address = 0;
        self.function_code = 0;
        self.register_address = 0;
        self.register_count = 0;
        self.expected_byte_count = 0;
        self.payload.clear();
        self.crc_high = 0;
        self.crc_low = 0;
    }

    fn received_crc(&self) -> u16 {
        crc_from_wire(self.crc_high, self.crc_low)
    }

    fn calculated_crc(&self) -> u16 {
        // expected_byte_count fits a byte, or the byte count check would have failed
        let head = [self.slave_address, self.function_code, self.expected_byte_count as u8];
        crc16_parts(&[&head, &self.payload])
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParserStats {
    pub bytes_received: u64,
    pub transactions_started: u64,
    pub readings_emitted: u64,
    pub request_crc_errors: u64,
    pub response_crc_errors: u64,
    pub desyncs: u64,
    pub foreign_transactions: u64,
    pub decode_errors: u64,
    pub empty_readings: u64,
}

impl ParserStats {
    pub fn print_summary(&self) {
        info!("Parser Statistics:");
        info!("  Bytes received: {}", self.bytes_received);
        info!("  Transactions started: {}", self.transactions_started);
        info!("  Readings emitted: {}", self.readings_emitted);
        info!("  Errors:");
        info!("    Request CRC: {}", self.request_crc_errors);
        info!("    Response CRC: {}", self.response_crc_errors);
        info!("    Desyncs: {}", self.desyncs);
        info!("    Decode: {}", self.decode_errors);
        info!("  Ignored:");
        info!("    Other slaves: {}", self.foreign_transactions);
        info!("    Nothing decoded: {}", self.empty_readings);
    }

    fn record(&mut self, err: &FrameError) {
        match err {
            FrameError::RequestCrc { .. } => self.request_crc_errors += 1,
            FrameError::ResponseCrc { .. } => self.response_crc_errors += 1,
            _ => self.desyncs += 1,
        }
    }
}

/// Follows master/slave read transactions in a sniffed byte stream.
///
/// Feed it every byte with its arrival time; it hands back a
/// [`DecodedReading`] whenever a response passes its CRC check. Any
/// inconsistency drops the transaction and the parser goes back to
/// [`ParserState::AwaitingMasterRequest`], which is how it resynchronizes.
pub struct TransactionParser {
    schema: Arc<RegisterSchema>,
    frame_gap: Duration,
    slave_filter: Option<u8>,

    state: ParserState,
    context: TransactionContext,
    // following a transaction for another slave, nothing gets decoded
    foreign: bool,
    capture: Vec<u8>,
    last_byte_time: Option<Instant>,

    stats: ParserStats,
}

impl TransactionParser {
    pub fn new(schema: Arc<RegisterSchema>) -> Self {
        Self {
            schema,
            frame_gap: DEFAULT_FRAME_GAP,
            slave_filter: None,
            state: ParserState::AwaitingMasterRequest,
            context: TransactionContext::default(),
            foreign: false,
            capture: Vec::with_capacity(MAX_ADU_LEN),
            last_byte_time: None,
            stats: ParserStats::default(),
        }
    }

    pub fn from_config(config: &Config, schema: Arc<RegisterSchema>) -> Self {
        Self::new(schema)
            .with_frame_gap(config.device.frame_gap())
            .with_slave_filter(config.device.modbus_address())
    }

    pub fn with_frame_gap(mut self, frame_gap: Duration) -> Self {
        self.frame_gap = frame_gap;
        self
    }

    pub fn with_slave_filter(mut self, slave_address: Option<u8>) -> Self {
        self.slave_filter = slave_address;
        self
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }

    /// Run until the capture side closes its channel.
    pub async fn start(mut self, mut from_capture: capture::Receiver, to_mqtt: mqtt::Sender) -> Result<ParserStats> {
        debug!("parser starting");

        while let Some(event) = from_capture.recv().await {
            if let Some(reading) = self.feed(event) {
                if to_mqtt.send(reading).is_err() {
                    bail!("send(to_mqtt) failed - channel closed?");
                }
            }
        }

        info!("capture channel closed, parser exiting");
        Ok(self.stats)
    }

    pub fn feed(&mut self, event: capture::ByteEvent) -> Option<DecodedReading> {
        self.stats.bytes_received += 1;

        // nothing seen yet counts as silence
        let boundary = self
            .last_byte_time
            .map_or(true, |last| event.timestamp.saturating_duration_since(last) > self.frame_gap);
        self.last_byte_time = Some(event.timestamp);

        match self.state {
            ParserState::AwaitingMasterRequest => self.scan(event.byte, boundary),
            _ => self.step(event.byte),
        }
    }

    fn scan(&mut self, byte: u8, boundary: bool) -> Option<DecodedReading> {
        self.capture.push(byte);

        if !boundary {
            if self.capture.len() > MAX_ADU_LEN {
                let excess = self.capture.len() - MAX_ADU_LEN;
                self.capture.drain(..excess);
            }
            return None;
        }

        trace!("frame boundary, buffered: {}", hex(&self.capture));

        if self.capture.len() < SYNC_LEN {
            // what came before the silence is too short to be a request
            self.keep_newest();
            return None;
        }

        match self.synchronize() {
            Ok(header) => {
                self.foreign = self.slave_filter.map_or(false, |wanted| wanted != header.slave_address);
                if self.foreign {
                    debug!("following transaction for slave {}", header.slave_address);
                    self.stats.foreign_transactions += 1;
                } else {
                    debug!(
                        "waiting for slave {} registers address: {:#06x}, amount: {}",
                        header.slave_address, header.register_address, header.register_count
                    );
                    self.stats.transactions_started += 1;
                }
                self.context.begin(&header);
                self.state = ParserState::ReadingFunctionCode;

                // byte 8 is the reply's slave address, anything after it belongs to the reply too
                let rest = self.capture.split_off(SYNC_LEN);
                self.capture.clear();
                let mut reading = None;
                for byte in rest {
                    if let Some(r) = self.step(byte) {
                        reading = Some(r);
                    }
                }
                reading
            }
            Err(err) => {
                self.desync(&err);
                self.keep_newest();
                None
            }
        }
    }

    fn synchronize(&self) -> Result<RequestHeader, FrameError> {
        let header = RequestHeader::from_request(&self.capture)?;

        let reply_address = self.capture[REQUEST_LEN];
        if reply_address != header.slave_address {
            return Err(FrameError::SlaveAddress {
                received: reply_address,
                expected: header.slave_address,
            });
        }

        Ok(header)
    }

    fn step(&mut self, byte: u8) -> Option<DecodedReading> {
        use ParserState::*;

        match self.state {
            AwaitingMasterRequest => {
                self.capture.push(byte);
            }
            ReadingFunctionCode => {
                let expected = self.context.function_code;
                if byte == expected {
                    self.state = ReadingByteCount;
                } else if byte == expected | EXCEPTION_BIT {
                    self.abort(FrameError::Exception { function: expected });
                } else {
                    self.abort(FrameError::FunctionCode { received: byte, expected });
                }
            }
            ReadingByteCount => {
                let expected = self.context.expected_byte_count;
                if usize::from(byte) == expected {
                    self.context.payload.clear();
                    self.state = if expected == 0 { ReadingCrcHigh } else { ReadingData };
                } else {
                    self.abort(FrameError::ByteCount { received: byte, expected });
                }
            }
            ReadingData => {
                self.context.payload.push(byte);
                if self.context.payload.len() >= self.context.expected_byte_count {
                    self.state = ReadingCrcHigh;
                }
            }
            ReadingCrcHigh => {
                self.context.crc_high = byte;
                self.state = ReadingCrcLow;
            }
            ReadingCrcLow => {
                self.context.crc_low = byte;
                let reading = self.complete();
                self.finish();
                return reading;
            }
        }

        None
    }

    fn complete(&mut self) -> Option<DecodedReading> {
        let received = self.context.received_crc();
        let calculated = self.context.calculated_crc();
        if received != calculated {
            let err = FrameError::ResponseCrc { received, calculated };
            self.desync(&err);
            return None;
        }

        if self.foreign {
            return None;
        }

        debug!("modbus_slave_data: {}", hex(&self.context.payload));

        let address = self.context.register_address;
        match self.schema.decode_block(address, &self.context.payload) {
            Ok(values) if values.is_empty() => {
                debug!("nothing in schema for registers at {:#06x}, not publishing", address);
                self.stats.empty_readings += 1;
                None
            }
            Ok(values) => {
                self.stats.readings_emitted += 1;
                Some(DecodedReading::new(Subtopic::from_address(address), values))
            }
            Err(err) => {
                warn!("dropping reading for registers at {:#06x}: {}", address, err);
                self.stats.decode_errors += 1;
                None
            }
        }
    }

    fn abort(&mut self, err: FrameError) {
        self.desync(&err);
        self.finish();
    }

    fn desync(&mut self, err: &FrameError) {
        warn!("{}", err);
        self.stats.record(err);
    }

    fn finish(&mut self) {
        self.context.reset();
        self.foreign = false;
        self.capture.clear();
        self.state = ParserState::AwaitingMasterRequest;
    }

    fn keep_newest(&mut self) {
        if let Some(&newest) = self.capture.last() {
            self.capture.clear();
            self.capture.push(newest);
        }
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::crc::{crc16, crc_to_wire};

    fn entry(id: &str, address: u16, value_type: &str) -> RegisterSchemaEntry {
        RegisterSchemaEntry {
            id: id.to_string(),
            name: id.to_string(),
            address,
            value_type: value_type.to_string(),
            multiply: 1.0,
            unit: String::new(),
            skip: false,
        }
    }

    fn with_crc(frame: &[u8]) -> Vec<u8> {
        [frame, &crc_to_wire(crc16(frame))[..]].concat()
    }

    struct Clock(Instant);

    impl Clock {
        fn feed(&mut self, parser: &mut TransactionParser, bytes: &[u8]) -> Vec<DecodedReading> {
            // a silence before every frame, 1ms between bytes inside it
            self.0 += Duration::from_millis(10);
            let mut out = Vec::new();
            for (i, byte) in bytes.iter().enumerate() {
                if i > 0 {
                    self.0 += Duration::from_millis(1);
                }
                out.extend(parser.feed(capture::ByteEvent::new(self.0, *byte)));
            }
            out
        }
    }

    fn parser() -> TransactionParser {
        TransactionParser::new(Arc::new(RegisterSchema::new(vec![entry("a", 0, "UINT16"), entry("b", 1, "UINT16")])))
    }

    #[test]
    fn follows_states() {
        let mut parser = parser();
        let mut clock = Clock(Instant::now());

        clock.feed(&mut parser, &with_crc(&[1, 3, 0, 0, 0, 2]));
        assert_eq!(parser.state(), ParserState::AwaitingMasterRequest);

        let reply = with_crc(&[1, 3, 4, 0, 5, 0, 6]);
        clock.feed(&mut parser, &reply[..1]);
        assert_eq!(parser.state(), ParserState::ReadingFunctionCode);
        assert_eq!(parser.context().register_count, 2);
        assert_eq!(parser.context().expected_byte_count, 4);

        let mut readings = Vec::new();
        let expected = [
            ParserState::ReadingByteCount,
            ParserState::ReadingData,
            ParserState::ReadingData,
            ParserState::ReadingData,
            ParserState::ReadingData,
            ParserState::ReadingCrcHigh,
            ParserState::ReadingCrcLow,
            ParserState::AwaitingMasterRequest,
        ];
        for (byte, state) in reply[1..].iter().zip(expected) {
            clock.0 += Duration::from_millis(1);
            readings.extend(parser.feed(capture::ByteEvent::new(clock.0, *byte)));
            assert_eq!(parser.state(), state);
            assert!(parser.context().payload.len() <= parser.context().expected_byte_count);
        }

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].get("a"), Some(5.0));
        assert_eq!(readings[0].get("b"), Some(6.0));
        assert_eq!(parser.context(), &TransactionContext::default());
    }

    #[test]
    fn byte_count_mismatch_resyncs() {
        let mut parser = parser();
        let mut clock = Clock(Instant::now());

        clock.feed(&mut parser, &with_crc(&[1, 3, 0, 0, 0, 2]));
        let readings = clock.feed(&mut parser, &with_crc(&[1, 3, 2, 0, 5]));
        assert!(readings.is_empty());
        assert_eq!(parser.stats().desyncs, 1);

        clock.feed(&mut parser, &with_crc(&[1, 3, 0, 0, 0, 2]));
        let readings = clock.feed(&mut parser, &with_crc(&[1, 3, 4, 0, 5, 0, 6]));
        assert_eq!(readings.len(), 1);
    }

    #[test]
    fn exception_reply_resyncs() {
        let mut parser = parser();
        let mut clock = Clock(Instant::now());

        clock.feed(&mut parser, &with_crc(&[1, 3, 0, 0, 0, 2]));
        assert!(clock.feed(&mut parser, &with_crc(&[1, 0x83, 2])).is_empty());
        assert_eq!(parser.stats().desyncs, 1);
        assert_eq!(parser.state(), ParserState::AwaitingMasterRequest);
    }

    #[test]
    fn slave_filter_ignores_other_devices() {
        let mut parser = parser().with_slave_filter(Some(2));
        let mut clock = Clock(Instant::now());

        clock.feed(&mut parser, &with_crc(&[1, 3, 0, 0, 0, 2]));
        assert!(clock.feed(&mut parser, &with_crc(&[1, 3, 4, 0, 5, 0, 6])).is_empty());
        assert_eq!(parser.stats().foreign_transactions, 1);
        assert_eq!(parser.state(), ParserState::AwaitingMasterRequest);

        clock.feed(&mut parser, &with_crc(&[2, 3, 0, 0, 0, 2]));
        assert_eq!(clock.feed(&mut parser, &with_crc(&[2, 3, 4, 0, 5, 0, 6])).len(), 1);
        assert_eq!(parser.stats().request_crc_errors, 0);
        assert_eq!(parser.stats().desyncs, 0);
    }

    #[test]
    fn capture_buffer_is_bounded_without_gaps() {
        let mut parser = parser();
        let mut clock = Clock(Instant::now());

        let noise: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        assert!(clock.feed(&mut parser, &noise).is_empty());
        assert!(parser.capture.len() <= MAX_ADU_LEN);
    }

    #[test]
    fn short_frames_do_not_block_resync() {
        let mut parser = parser();
        let mut clock = Clock(Instant::now());

        // tail of a reply seen at startup
        clock.feed(&mut parser, &[0x00, 0x07, 0x12, 0x34]);
        clock.feed(&mut parser, &with_crc(&[1, 3, 0, 1, 0, 1]));
        let readings = clock.feed(&mut parser, &with_crc(&[1, 3, 2, 0, 9]));

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].get("b"), Some(9.0));
    }
}
