/// Re-slices arbitrarily sized inbound chunks into fixed-size frames.
///
/// Inbound chunk boundaries come from the client and carry no meaning for
/// the backend, which wants frames of exactly `frame_bytes` (the last frame
/// of a stream may be shorter).
#[derive(Debug)]
pub struct FrameSplitter {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameSplitter {
    pub fn new(frame_bytes: usize) -> Self {
        let frame_bytes = frame_bytes.max(2);
        Self {
            frame_bytes,
            pending: Vec::with_capacity(frame_bytes),
        }
    }

    /// Add a chunk and return every frame that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let complete = self.pending.len() / self.frame_bytes;
        if complete == 0 {
            return Vec::new();
        }

        let tail = self.pending.split_off(complete * self.frame_bytes);
        let full = std::mem::replace(&mut self.pending, tail);
        full.chunks(self.frame_bytes).map(<[u8]>::to_vec).collect()
    }

    /// Take whatever is left as a final short frame.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_across_chunk_boundaries() {
        let mut splitter = FrameSplitter::new(4);

        assert!(splitter.push(&[1, 2, 3]).is_empty());
        assert_eq!(splitter.push(&[4, 5]), vec![vec![1, 2, 3, 4]]);
        assert_eq!(splitter.push(&[6, 7, 8, 9, 10, 11]), vec![vec![5, 6, 7, 8]]);
        assert_eq!(splitter.pending_bytes(), 3);
        assert_eq!(splitter.flush(), Some(vec![9, 10, 11]));
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn three_2000_byte_chunks_make_six_1024_byte_frames_worth() {
        let mut splitter = FrameSplitter::new(1024);
        let mut frames = Vec::new();
        for i in 0..3u8 {
            frames.extend(splitter.push(&vec![i; 2000]));
        }
        frames.extend(splitter.flush());

        assert_eq!(frames.len(), 6);
        assert!(frames[..5].iter().all(|f| f.len() == 1024));
        assert_eq!(frames[5].len(), 6000 - 5 * 1024);

        let joined: Vec<u8> = frames.concat();
        assert_eq!(joined.len(), 6000);
        assert!(joined[..2000].iter().all(|&b| b == 0));
        assert!(joined[2000..4000].iter().all(|&b| b == 1));
        assert!(joined[4000..].iter().all(|&b| b == 2));
    }
}
