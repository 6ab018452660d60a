//! Bounded in-memory capture of a child's stdout/stderr (spec §4.5 step 8).
//! Once the cap is hit the remainder is dropped and counted rather than
//! buffered, so a runaway command cannot exhaust runner memory.

pub struct CaptureBuffer {
    cap: usize,
    buf: Vec<u8>,
    dropped: u64,
}

impl CaptureBuffer {
    pub fn new(cap: usize) -> Self {
        Self { cap, buf: Vec::new(), dropped: 0 }
    }

    pub fn push(&mut self, data: &[u8]) {
        let remaining = self.cap.saturating_sub(self.buf.len());
        if remaining == 0 {
            self.dropped += data.len() as u64;
            return;
        }
        if data.len() <= remaining {
            self.buf.extend_from_slice(data);
        } else {
            self.buf.extend_from_slice(&data[..remaining]);
            self.dropped += (data.len() - remaining) as u64;
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn overflowed(&self) -> bool {
        self.dropped > 0
    }
}
