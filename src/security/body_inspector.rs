use crate::error::SecurityError;
use bytes::Bytes;

/// Accumulates a streamed request body up to a size limit so the full body
/// can be scanned before anything reaches the upstream.
pub struct BodyInspector {
    pub max_body_size: u64,
    buffer: Vec<u8>,
}

impl BodyInspector {
    pub fn new(max_body_size: u64) -> Self {
        Self {
            max_body_size,
            buffer: Vec::new(),
        }
    }

    pub fn append_chunk(&mut self, chunk: &Bytes) -> Result<(), SecurityError> {
        let size = (self.buffer.len() + chunk.len()) as u64;
        if size > self.max_body_size {
            return Err(SecurityError::RequestTooLarge {
                size,
                limit: self.max_body_size,
            });
        }

        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn body(&self) -> &[u8] {
        &self.buffer
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_chunks() {
        let mut inspector = BodyInspector::new(16);
        inspector.append_chunk(&Bytes::from_static(b"hello ")).unwrap();
        inspector.append_chunk(&Bytes::from_static(b"world")).unwrap();
        assert_eq!(inspector.body(), b"hello world");
        assert_eq!(inspector.take_body(), b"hello world".to_vec());
        assert!(inspector.body().is_empty());
    }

    #[test]
    fn test_rejects_oversized_body() {
        let mut inspector = BodyInspector::new(4);
        let err = inspector
            .append_chunk(&Bytes::from_static(b"too long"))
            .unwrap_err();
        assert!(matches!(err, SecurityError::RequestTooLarge { size: 8, limit: 4 }));
    }
}
