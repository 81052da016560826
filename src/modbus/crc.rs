use crc16::{State, MODBUS};

/// ModBus CRC16: polynomial 0xA001 (reflected), initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

/// CRC over several slices without concatenating them first.
pub fn crc16_parts(parts: &[&[u8]]) -> u16 {
    let mut state = State::<MODBUS>::new();
    for part in parts {
        state.update(part);
    }
    state.get()
}

/// The CRC as it appears on the observed bus: the first byte carries the low-order half.
pub fn crc_from_wire(first: u8, second: u8) -> u16 {
    u16::from_le_bytes([first, second])
}

/// Inverse of [`crc_from_wire`], in transmission order.
pub fn crc_to_wire(crc: u16) -> [u8; 2] {
    crc.to_le_bytes()
}
