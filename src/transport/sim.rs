//! In-process loopback to a simulated dumper.
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;

use super::Transport;
use crate::constants::DATA_CHUNK_SIZE;
use crate::firmware::{Dispatcher, SimConfig, SimulatedCart};

/// Runs the device dispatcher against a [`SimulatedCart`] on the calling
/// thread. Replies are queued per device transfer, so reads see the same
/// boundaries a USB host would.
pub struct SimTransport {
    dispatcher: Dispatcher<SimulatedCart>,
    replies: VecDeque<Vec<u8>>,
    max_transfer: Option<usize>,
    stream_limit: Option<u64>,
    delivered: u64,
    stalled: bool,
}

impl SimTransport {
    pub fn new(config: SimConfig) -> Self {
        Self::with_dispatcher(Dispatcher::new(SimulatedCart::new(config)))
    }

    pub fn with_dispatcher(dispatcher: Dispatcher<SimulatedCart>) -> Self {
        SimTransport {
            dispatcher,
            replies: VecDeque::new(),
            max_transfer: None,
            stream_limit: None,
            delivered: 0,
            stalled: false,
        }
    }

    /// Splits every device transfer into pieces of at most `len` bytes.
    pub fn fragment(mut self, len: usize) -> Self {
        self.max_transfer = Some(len.max(1));
        self
    }

    /// Delivers only the first `limit` bytes of data chunks, then nothing
    /// at all, like a link that stalls at the end of a long dump.
    pub fn stream_limit(mut self, limit: u64) -> Self {
        self.stream_limit = Some(limit);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<SimulatedCart> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<SimulatedCart> {
        &mut self.dispatcher
    }

    pub fn cart(&self) -> &SimulatedCart {
        self.dispatcher.bus()
    }

    pub fn cart_mut(&mut self) -> &mut SimulatedCart {
        self.dispatcher.bus_mut()
    }
}

impl Transport for SimTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        let mut out = VecDeque::new();
        self.dispatcher.feed(raw, &mut out);

        for mut transfer in out {
            if self.stalled {
                break;
            }
            if let Some(limit) = self.stream_limit
                && transfer.len() == DATA_CHUNK_SIZE
            {
                let room = limit.saturating_sub(self.delivered);
                if room < transfer.len() as u64 {
                    transfer.truncate(room as usize);
                    self.stalled = true;
                }
                self.delivered += transfer.len() as u64;
            }
            if transfer.is_empty() {
                continue;
            }
            match self.max_transfer {
                Some(max) => self
                    .replies
                    .extend(transfer.chunks(max).map(|piece| piece.to_vec())),
                None => self.replies.push_back(transfer),
            }
        }
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let Some(mut transfer) = self.replies.pop_front() else {
            return Ok(0);
        };
        let n = transfer.len().min(buf.len());
        buf[..n].copy_from_slice(&transfer[..n]);
        if n < transfer.len() {
            transfer.drain(..n);
            self.replies.push_front(transfer);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn replies_keep_transfer_boundaries() {
        let mut sim = SimTransport::new(SimConfig::default()).fragment(10);
        sim.send_command(Command::Connect).unwrap();

        let mut buf = [0u8; 64];
        let n = sim.recv_raw(&mut buf, Duration::ZERO).unwrap();
        assert_eq!(&buf[..n], b"FlashMaste");
        let mut small = [0u8; 4];
        assert_eq!(sim.recv_raw(&mut small, Duration::ZERO).unwrap(), 4);
        assert_eq!(&small, b"r MD");
    }

    #[test]
    fn empty_queue_reads_nothing() {
        let mut sim = SimTransport::new(SimConfig::default());
        let mut buf = [0u8; 64];
        assert_eq!(sim.recv_raw(&mut buf, Duration::from_secs(5)).unwrap(), 0);
    }

    #[test]
    fn stream_limit_stalls_inside_a_chunk() {
        let mut sim = SimTransport::new(SimConfig::default()).stream_limit(1500);
        sim.send_command(Command::ReadRom {
            size: crate::geometry::SizeCode::K512,
        })
        .unwrap();

        let mut buf = [0u8; DATA_CHUNK_SIZE];
        let mut chunks = Vec::new();
        loop {
            let n = sim.recv_raw(&mut buf, Duration::ZERO).unwrap();
            if n == 0 {
                break;
            }
            chunks.push(n);
        }
        // status line, one whole chunk, then a torn one and silence
        assert_eq!(chunks[1..], [DATA_CHUNK_SIZE, 476]);
    }
}
