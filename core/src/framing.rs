//! Characteristic data framing
//!
//! Outbound payloads are split into writes no larger than the profile's packet size and
//! paced one write per acknowledgement. Inbound notifications are accumulated until the
//! profile's terminator shows up, which may straddle two notifications.

/// Number of writes needed for `len` bytes with packets of at most `max_packet_size`
pub fn chunk_count(len: usize, max_packet_size: usize) -> usize {
    len.div_ceil(max_packet_size)
}

/// Outbound transfer cursor
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    data: Vec<u8>,
    max_packet_size: usize,
    bytes_sent: usize,
    total_bytes_sent: usize,
    /// Size of the chunk written but not yet acknowledged
    in_flight: usize,
}

impl OutboundTransfer {
    /// Start a transfer of `data` in packets of at most `max_packet_size` bytes
    pub fn new(data: Vec<u8>, max_packet_size: usize) -> Self {
        Self {
            data,
            max_packet_size: max_packet_size.max(1),
            bytes_sent: 0,
            total_bytes_sent: 0,
            in_flight: 0,
        }
    }

    pub fn bytes_to_send(&self) -> usize {
        self.data.len()
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn total_bytes_sent(&self) -> usize {
        self.total_bytes_sent
    }

    /// True while a chunk is awaiting acknowledgement
    pub fn is_awaiting_ack(&self) -> bool {
        self.in_flight > 0
    }

    /// True once every byte has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.bytes_sent == self.data.len()
    }

    /// Take the next chunk to write; `None` while a chunk is in flight or when done
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.is_awaiting_ack() || self.is_complete() {
            return None;
        }
        let end = (self.bytes_sent + self.max_packet_size).min(self.data.len());
        let chunk = self.data[self.bytes_sent..end].to_vec();
        self.in_flight = chunk.len();
        Some(chunk)
    }

    /// Record the acknowledgement of the in-flight chunk, returning its size
    pub fn acknowledge(&mut self) -> usize {
        let acked = self.in_flight;
        self.bytes_sent += acked;
        self.total_bytes_sent += acked;
        self.in_flight = 0;
        acked
    }
}

/// Inbound reassembly buffer
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    terminator: Vec<u8>,
    /// Offset before which no terminator can start
    scanned: usize,
}

impl FrameAssembler {
    /// Create an assembler splitting on `terminator`
    pub fn new(terminator: &[u8]) -> Self {
        Self {
            buffer: Vec::new(),
            terminator: terminator.to_vec(),
            scanned: 0,
        }
    }

    /// Append a delivery and return every frame it completed, terminator stripped
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(at) = self.find_terminator() {
            let frame: Vec<u8> = self.buffer.drain(..at + self.terminator.len()).collect();
            frames.push(frame[..at].to_vec());
            self.scanned = 0;
        }
        // Keep the tail that could still be the start of a split terminator
        self.scanned = self
            .buffer
            .len()
            .saturating_sub(self.terminator.len().saturating_sub(1));
        frames
    }

    fn find_terminator(&self) -> Option<usize> {
        let width = self.terminator.len();
        if width == 0 || self.buffer.len() < width {
            return None;
        }
        let start = self.scanned.min(self.buffer.len());
        self.buffer[start..]
            .windows(width)
            .position(|window| window == self.terminator.as_slice())
            .map(|pos| pos + start)
    }

    /// Bytes received so far that are not yet part of a complete frame
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Discard the partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}
