use crate::prelude::*;

/// The two one-directional queues of the pipeline, capture -> parser -> mqtt.
///
/// Both are unbounded so neither the capture thread nor the parser ever wait
/// on the stage after them. Each stage takes its halves by value; a stage
/// returning drops its sender, which ends the next stage in turn.
#[derive(Debug)]
pub struct Channels {
    pub to_parser: capture::Sender,
    pub from_capture: capture::Receiver,
    pub to_mqtt: mqtt::Sender,
    pub from_parser: mqtt::Receiver,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        let (to_parser, from_capture) = mpsc::unbounded_channel();
        let (to_mqtt, from_parser) = mpsc::unbounded_channel();

        Self {
            to_parser,
            from_capture,
            to_mqtt,
            from_parser,
        }
    }
}
