//! Writer that confirms everything and keeps nothing.

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;

use crate::common::errors::Result;
use crate::common::metrics as metric;
use crate::common::types::Scn;
use crate::writer::{ConfirmedWatermark, Writer};

pub struct DiscardWriter {
    confirmed: Arc<ConfirmedWatermark>,
}

impl DiscardWriter {
    pub fn new(confirmed: Arc<ConfirmedWatermark>) -> DiscardWriter {
        DiscardWriter { confirmed }
    }
}

impl Writer for DiscardWriter {
    fn send(&mut self, scn: Scn, idx: u64, message: Bytes) -> Result<()> {
        counter!(metric::MESSAGES_SENT).increment(1);
        counter!(metric::BYTES_SENT).increment(message.len() as u64);
        counter!(metric::MESSAGES_CONFIRMED).increment(1);
        counter!(metric::BYTES_CONFIRMED).increment(message.len() as u64);
        self.confirmed.store(scn, idx);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
