use crate::prelude::*;

use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

/// Numeric encodings used by the meter's registers.
///
/// Inside a word the byte order is MSB first. Wider values are assembled
/// least significant word first, which is what the meter actually sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
}

impl ValueType {
    pub fn register_count(self) -> usize {
        use ValueType::*;

        match self {
            Int16 | Uint16 => 1,
            Int32 | Uint32 => 2,
            Int64 | Uint64 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        use ValueType::*;

        match self {
            Int16 => "INT16",
            Uint16 => "UINT16",
            Int32 => "INT32",
            Uint32 => "UINT32",
            Int64 => "INT64",
            Uint64 => "UINT64",
        }
    }
}

impl FromStr for ValueType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ValueType::*;

        match s {
            "INT16" => Ok(Int16),
            "UINT16" => Ok(Uint16),
            "INT32" => Ok(Int32),
            "UINT32" => Ok(Uint32),
            "INT64" => Ok(Int64),
            "UINT64" => Ok(Uint64),
            other => Err(SchemaError::UnknownValueType(other.to_owned())),
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assemble `words` per `value_type` and apply the scale factor.
pub fn decode(words: &[u16], value_type: ValueType, multiply: f64) -> Result<f64, SchemaError> {
    use ValueType::*;

    let needed = value_type.register_count();
    if words.len() < needed {
        return Err(SchemaError::ShortRead {
            value_type,
            needed,
            available: words.len(),
        });
    }

    // least significant word first
    let raw = words[..needed]
        .iter()
        .rev()
        .fold(0u64, |acc, w| (acc << 16) | u64::from(*w));

    let value = match value_type {
        Int16 => f64::from(raw as u16 as i16),
        Uint16 => f64::from(raw as u16),
        Int32 => f64::from(raw as u32 as i32),
        Uint32 => f64::from(raw as u32),
        Int64 => raw as i64 as f64,
        Uint64 => raw as f64,
    };

    Ok(value * multiply)
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RegisterSchemaEntry {
    pub id: String,
    pub name: String,
    pub address: u16,
    // kept as the raw tag; a bad tag is a config defect reported at decode time
    pub value_type: String,
    #[serde(default = "default_multiply")]
    pub multiply: f64,
    #[serde(default, rename = "unit_of_measurement")]
    pub unit: String,
    #[serde(default)]
    pub skip: bool,
}

fn default_multiply() -> f64 {
    1.0
}

impl RegisterSchemaEntry {
    pub fn value_type(&self) -> Result<ValueType, SchemaError> {
        self.value_type.parse()
    }

    pub fn register_count(&self) -> Result<usize, SchemaError> {
        Ok(self.value_type()?.register_count())
    }

    pub fn decode(&self, words: &[u16]) -> Result<f64, SchemaError> {
        decode(words, self.value_type()?, self.multiply)
    }
}

/// Register address -> schema entry. Read-only once built.
#[derive(Clone, Debug, Default)]
pub struct RegisterSchema {
    registers: HashMap<u16, RegisterSchemaEntry>,
}

impl RegisterSchema {
    pub fn new(entries: Vec<RegisterSchemaEntry>) -> Self {
        let mut registers = HashMap::new();

        for entry in entries {
            if let Some(old) = registers.insert(entry.address, entry) {
                warn!("register {:#06x} defined twice, dropping {}", old.address, old.id);
            }
        }

        Self { registers }
    }

    pub fn get(&self, address: u16) -> Option<&RegisterSchemaEntry> {
        self.registers.get(&address)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Walk a response payload register by register, starting at `start`.
    ///
    /// Addresses missing from the schema are skipped one register at a time,
    /// `skip` entries consume their width without producing a value. Any
    /// SchemaError aborts the whole block since the remaining words can no
    /// longer be aligned.
    pub fn decode_block(&self, start: u16, payload: &[u8]) -> Result<Vec<(String, f64)>, SchemaError> {
        let words: Vec<u16> = payload
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        let mut values = Vec::new();
        let mut offset = 0;

        while offset < words.len() {
            let address = start.wrapping_add(offset as u16);

            let Some(entry) = self.get(address) else {
                trace!("register {:#06x} not in schema, skipping", address);
                offset += 1;
                continue;
            };

            let width = entry.register_count()?;
            if entry.skip {
                offset += width;
                continue;
            }

            let value = entry.decode(&words[offset..])?;
            debug!("{} {} {}", entry.name, value, entry.unit);
            values.push((entry.id.clone(), value));
            offset += width;
        }

        Ok(values)
    }
}
