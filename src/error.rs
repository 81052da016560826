use thiserror::Error;

use crate::register::ValueType;

/// Raised while turning raw registers into values. Fatal for the reading being decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown value type {0:?}")]
    UnknownValueType(String),

    #[error("{value_type} needs {needed} registers, only {available} left in payload")]
    ShortRead {
        value_type: ValueType,
        needed: usize,
        available: usize,
    },
}

/// Reasons the sniffer drops a transaction and goes back to scanning for a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("request needs {needed} bytes, have {available}")]
    ShortRequest { needed: usize, available: usize },

    #[error("request crc error: received={received:#06x} calculated={calculated:#06x}")]
    RequestCrc { received: u16, calculated: u16 },

    #[error("response crc error: received={received:#06x} calculated={calculated:#06x}")]
    ResponseCrc { received: u16, calculated: u16 },

    #[error("reply from slave {received}, expected {expected}")]
    SlaveAddress { received: u8, expected: u8 },

    #[error("function code error: received {received:#04x}, expected {expected:#04x}")]
    FunctionCode { received: u8, expected: u8 },

    #[error("exception reply to function {function:#04x}")]
    Exception { function: u8 },

    #[error("byte count error: received {received}, expected {expected}")]
    ByteCount { received: u8, expected: usize },
}

/// Creates an anyhow error with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*)
        )
    };
}

/// Creates an anyhow error with the current file and line number, and includes a source error
#[macro_export]
macro_rules! file_error_with_source {
    ($source:expr, $($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}: {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*),
            $source
        )
    };
}
