//! Local detach sequence detection on raw terminal input.

/// Result of filtering one chunk of input.
#[derive(Debug, PartialEq, Eq)]
pub enum Filtered {
    /// Forward these bytes to the server.
    Forward(Vec<u8>),
    /// The detach sequence completed. Carries the bytes that preceded it in
    /// this chunk, which should still be forwarded.
    Detach(Vec<u8>),
}

/// Streaming matcher for a multi-byte detach sequence.
///
/// Bytes that might start the sequence are held back until the match either
/// completes (and they are dropped) or fails (and they are released in order).
/// Partial matches survive across chunks.
#[derive(Debug, Clone)]
pub struct EscapeDetector {
    keys: Vec<u8>,
    matched: usize,
}

impl EscapeDetector {
    /// An empty key sequence disables detection.
    #[must_use]
    pub fn new(keys: Vec<u8>) -> Self {
        Self { keys, matched: 0 }
    }

    /// Number of sequence bytes currently held back.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.matched
    }

    pub fn filter(&mut self, input: &[u8]) -> Filtered {
        if self.keys.is_empty() {
            return Filtered::Forward(input.to_vec());
        }

        let mut out = Vec::with_capacity(input.len() + self.matched);
        for &byte in input {
            if byte == self.keys[self.matched] {
                self.matched += 1;
            } else {
                // Release the held prefix, then see whether this byte starts
                // a fresh match.
                out.extend_from_slice(&self.keys[..self.matched]);
                if byte == self.keys[0] {
                    self.matched = 1;
                } else {
                    self.matched = 0;
                    out.push(byte);
                }
            }

            if self.matched == self.keys.len() {
                self.matched = 0;
                return Filtered::Detach(out);
            }
        }
        Filtered::Forward(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTRL_P: u8 = 0x10;
    const CTRL_Q: u8 = 0x11;

    fn detector() -> EscapeDetector {
        EscapeDetector::new(vec![CTRL_P, CTRL_Q])
    }

    #[test]
    fn test_passthrough_normal_input() {
        let mut det = detector();
        assert_eq!(det.filter(b"hello"), Filtered::Forward(b"hello".to_vec()));
    }

    #[test]
    fn test_full_sequence_detaches() {
        let mut det = detector();
        assert_eq!(det.filter(&[CTRL_P, CTRL_Q]), Filtered::Detach(vec![]));
        assert_eq!(det.pending(), 0);
    }

    #[test]
    fn test_bytes_before_sequence_are_forwarded() {
        let mut det = detector();
        assert_eq!(
            det.filter(&[b'l', b's', CTRL_P, CTRL_Q, b'x']),
            Filtered::Detach(b"ls".to_vec())
        );
    }

    #[test]
    fn test_sequence_split_across_reads() {
        let mut det = detector();
        assert_eq!(det.filter(&[b'a', CTRL_P]), Filtered::Forward(b"a".to_vec()));
        assert_eq!(det.pending(), 1);
        assert_eq!(det.filter(&[CTRL_Q]), Filtered::Detach(vec![]));
    }

    #[test]
    fn test_broken_prefix_is_released_in_order() {
        let mut det = detector();
        assert_eq!(det.filter(&[CTRL_P]), Filtered::Forward(vec![]));
        assert_eq!(
            det.filter(&[b'x', b'y']),
            Filtered::Forward(vec![CTRL_P, b'x', b'y'])
        );
        assert_eq!(det.pending(), 0);
    }

    #[test]
    fn test_repeated_first_byte_restarts_match() {
        let mut det = detector();
        assert_eq!(
            det.filter(&[CTRL_P, CTRL_P, CTRL_Q]),
            Filtered::Detach(vec![CTRL_P])
        );
    }

    #[test]
    fn test_three_byte_sequence() {
        let mut det = EscapeDetector::new(vec![b'a', b'b', b'c']);
        assert_eq!(
            det.filter(b"xabz"),
            Filtered::Forward(b"xabz".to_vec())
        );
        assert_eq!(det.filter(b"1abc2"), Filtered::Detach(b"1".to_vec()));
    }

    #[test]
    fn test_single_key_sequence() {
        let mut det = EscapeDetector::new(vec![0x1d]);
        assert_eq!(det.filter(&[b'q', 0x1d]), Filtered::Detach(b"q".to_vec()));
    }

    #[test]
    fn test_empty_sequence_disables_detection() {
        let mut det = EscapeDetector::new(vec![]);
        assert_eq!(
            det.filter(&[CTRL_P, CTRL_Q]),
            Filtered::Forward(vec![CTRL_P, CTRL_Q])
        );
    }
}
