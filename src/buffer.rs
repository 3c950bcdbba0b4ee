//! Outbound byte buffering

use std::io::Write;

use circbuf::CircBuf;

use crate::error::HttpError;

/// A circular write buffer that temporarily grows to hold a single oversized write.
///
/// Connections serialize heads and body chunks into this buffer and drain it to the
/// transport on `drive`. When it cannot accept a write, the caller keeps the data and
/// retries later, which is how backpressure reaches body sinks.
pub struct GrowableCircleBuf {
    circbuf: CircBuf,
    one_time_buffer: Vec<u8>,
    one_time_offset: usize,
}
impl GrowableCircleBuf {
    /// Capacity is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Result<Self, HttpError> {
        let capacity = capacity.max(2).next_power_of_two();
        Ok(Self {
            circbuf: CircBuf::with_capacity(capacity)
                .map_err(|err| HttpError::protocol(format!("write buffer: {err:?}")))?,
            one_time_buffer: Vec::new(),
            one_time_offset: 0,
        })
    }

    /// return true if unread data size is 0
    pub fn is_empty(&self) -> bool {
        self.circbuf.is_empty() && self.one_time_buffer.is_empty()
    }

    /// return size of unread data
    pub fn len(&self) -> usize {
        if self.one_time_buffer.is_empty() {
            self.circbuf.len()
        } else {
            self.one_time_buffer.len() - self.one_time_offset
        }
    }

    /// free space before the buffer starts refusing writes
    pub fn available(&self) -> usize {
        if self.one_time_buffer.is_empty() {
            self.circbuf.avail()
        } else {
            0
        }
    }

    pub fn capacity(&self) -> usize {
        self.circbuf.cap()
    }

    /// return if data was written.
    /// data larger than the capacity will only write when the buffer is empty.
    pub fn try_write(&mut self, data: &[&[u8]]) -> Result<bool, HttpError> {
        let total_data_len = data.iter().map(|x| x.len()).sum::<usize>();
        if total_data_len == 0 {
            return Ok(true);
        }

        if total_data_len > self.circbuf.cap() {
            // data will never fit in circle buf, try to use one-time buffer
            if self.is_empty() {
                self.one_time_offset = 0;
                for d in data {
                    self.one_time_buffer.extend_from_slice(d);
                }
                return Ok(true);
            } else {
                // can only write to one-time buffer when circbuf is drained
                return Ok(false);
            }
        }

        if !self.one_time_buffer.is_empty() || total_data_len > self.circbuf.avail() {
            return Ok(false);
        }

        for d in data {
            self.circbuf.write_all(d)?;
        }

        Ok(true)
    }

    /// peek at available bytes
    pub fn peek_read(&self) -> &[u8] {
        if self.one_time_buffer.is_empty() {
            let avail = self.circbuf.get_bytes();
            if avail[0].is_empty() {
                avail[1]
            } else {
                avail[0]
            }
        } else {
            &self.one_time_buffer[self.one_time_offset..]
        }
    }

    /// advance bytes that were able to be consumed from read
    pub fn advance_read(&mut self, size: usize) -> Result<(), HttpError> {
        if self.one_time_buffer.is_empty() {
            self.circbuf
                .advance_read(size)
                .map_err(|err| HttpError::protocol(format!("write buffer: {err:?}")))
        } else if self.one_time_offset + size == self.one_time_buffer.len() {
            self.one_time_offset = 0;
            self.one_time_buffer = Vec::new();
            Ok(())
        } else if self.one_time_offset + size < self.one_time_buffer.len() {
            self.one_time_offset += size;
            Ok(())
        } else {
            Err(HttpError::protocol("over-read one-time buffer"))
        }
    }

    pub fn clear(&mut self) {
        while !self.is_empty() {
            let len = self.peek_read().len();
            if self.advance_read(len).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::GrowableCircleBuf;

    #[test]
    fn test_write_and_drain() {
        let mut buf = GrowableCircleBuf::new(16).unwrap();
        assert!(buf.try_write(&[b"GET ", b"/ HTTP/1.1"]).unwrap());
        assert_eq!(buf.len(), 14);
        let mut drained = Vec::new();
        while !buf.is_empty() {
            let chunk = buf.peek_read().to_vec();
            buf.advance_read(chunk.len()).unwrap();
            drained.extend_from_slice(&chunk);
        }
        assert_eq!(drained, b"GET / HTTP/1.1");
    }

    #[test]
    fn test_oversized_write_only_when_empty() {
        let mut buf = GrowableCircleBuf::new(8).unwrap();
        assert!(buf.try_write(&[b"abc"]).unwrap());
        let big = vec![7u8; 64];
        assert!(!buf.try_write(&[&big]).unwrap());
        buf.advance_read(3).unwrap();
        assert!(buf.try_write(&[&big]).unwrap());
        assert_eq!(buf.len(), 64);
        assert_eq!(buf.available(), 0);
        buf.advance_read(60).unwrap();
        assert_eq!(buf.peek_read(), &[7u8; 4]);
        buf.advance_read(4).unwrap();
        assert!(buf.is_empty());
    }
}
