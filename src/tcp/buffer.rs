use crate::tcp::defs::{SessionId, TcpError};
use anyhow::Result;
use std::sync::{Mutex, MutexGuard};

/// Byte addressable store holding one circular region of `window_size` bytes per session.
/// Address of a sequence number is `id * window_size + (seq mod window_size)`; regions are
/// allocated on first use.
#[derive(Debug)]
pub struct SessionBuffer {
    name: &'static str,
    regions: Vec<Mutex<Vec<u8>>>,
    window_size: u32,
}

impl SessionBuffer {
    pub fn new(name: &'static str, max_sessions: u16, window_size: u32) -> Self {
        Self {
            name,
            regions: (0..max_sessions).map(|_| Mutex::new(Vec::new())).collect(),
            window_size,
        }
    }

    pub fn address(&self, id: SessionId, seq: u32) -> u64 {
        id as u64 * self.window_size as u64 + (seq & (self.window_size - 1)) as u64
    }

    fn region(&self, id: SessionId) -> Result<MutexGuard<'_, Vec<u8>>> {
        let region = self
            .regions
            .get(id as usize)
            .ok_or(TcpError::InvalidSession { id })?;
        let mut guard = region
            .lock()
            .map_err(|_| anyhow::anyhow!("{} region of session {} is poisoned.", self.name, id))?;
        if guard.is_empty() {
            guard.resize(self.window_size as usize, 0);
        }
        Ok(guard)
    }

    /// Writes `data` starting at `seq`, wrapping at the end of the region.
    pub fn write(&self, id: SessionId, seq: u32, data: &[u8]) -> Result<()> {
        anyhow::ensure!(
            data.len() < self.window_size as usize,
            "{} write of {} bytes does not fit the {} bytes window.",
            self.name,
            data.len(),
            self.window_size
        );
        let mut region = self.region(id)?;
        let start = (seq & (self.window_size - 1)) as usize;
        let first = data.len().min(region.len() - start);
        region[start..start + first].copy_from_slice(&data[..first]);
        region[..data.len() - first].copy_from_slice(&data[first..]);
        Ok(())
    }

    pub fn read(&self, id: SessionId, seq: u32, length: usize) -> Result<Vec<u8>> {
        anyhow::ensure!(
            length < self.window_size as usize,
            "{} read of {} bytes does not fit the {} bytes window.",
            self.name,
            length,
            self.window_size
        );
        let region = self.region(id)?;
        let start = (seq & (self.window_size - 1)) as usize;
        let first = length.min(region.len() - start);
        let mut data = Vec::with_capacity(length);
        data.extend_from_slice(&region[start..start + first]);
        data.extend_from_slice(&region[..length - first]);
        Ok(data)
    }
}

#[cfg(test)]
mod buffer_tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 0x10000)]
    #[case(3, 0x30000 + 0x1234)]
    fn test_address(#[case] id: SessionId, #[case] expected: u64) {
        let buffer = SessionBuffer::new("rx buffer", 4, 0x10000);
        let seq = if id == 3 { 0xabcd_1234 } else { 0x0005_0000 };
        assert_eq!(buffer.address(id, seq), expected);
    }

    #[rstest]
    #[case(100, 10)]
    #[case(0xfffa, 12)]
    #[case(0x1_fff0, 0x20)]
    fn test_write_read_wraps(#[case] seq: u32, #[case] length: usize) {
        let buffer = SessionBuffer::new("tx buffer", 2, 0x10000);
        let data: Vec<u8> = (0..length).map(|i| i as u8).collect();
        buffer.write(1, seq, &data).unwrap();
        assert_eq!(buffer.read(1, seq, length).unwrap(), data);
        // the other session is untouched
        assert_eq!(buffer.read(0, seq, length).unwrap(), vec![0; length]);
    }

    #[test]
    fn test_invalid_session() {
        let buffer = SessionBuffer::new("rx buffer", 2, 0x10000);
        let err = buffer.write(2, 0, b"abc").unwrap_err();
        assert_eq!(
            err.downcast_ref::<TcpError>(),
            Some(&TcpError::InvalidSession { id: 2 })
        );
        assert!(buffer.read(0, 0, 0x10000).is_err());
    }
}
