pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};

pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use tokio::sync::mpsc;
pub use tokio_util::sync::CancellationToken;

pub use crate::{
    capture, channels::Channels, config, config::Config, error::*, modbus, mqtt,
    reading::{DecodedReading, Subtopic},
    register::{RegisterSchema, RegisterSchemaEntry, ValueType},
};
