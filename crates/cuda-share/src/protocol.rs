//! Messages exchanged between `serve` and `attach`.

use cuda_api::EventHandle;
use cuda_api::MemoryHandle;
use serde::Deserialize;
use serde::Serialize;

/// Sent by the exporter: everything the peer needs to map the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedBuffer {
    pub memory: MemoryHandle,
    /// Completes once the exporter's initialization of the buffer is done.
    pub ready: EventHandle,
    pub len: usize,
    /// Byte the exporter filled the buffer with.
    pub pattern: u8,
    /// Ordinal of the device holding the buffer, in the exporter's numbering.
    pub device: u32,
    pub exporter_pid: u32,
}

/// Sent back by the importer once it has inspected the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachReport {
    Verified {
        len: usize,
    },
    Mismatch {
        offset: usize,
        expected: u8,
        found: u8,
    },
    Failed(String),
}

impl AttachReport {
    /// Compares the mapped contents against the advertised pattern.
    pub fn inspect(contents: &[u8], pattern: u8) -> Self {
        match contents.iter().position(|&b| b != pattern) {
            None => AttachReport::Verified {
                len: contents.len(),
            },
            Some(offset) => AttachReport::Mismatch {
                offset,
                expected: pattern,
                found: contents[offset],
            },
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, AttachReport::Verified { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn inspect_finds_first_mismatch() {
        assert_eq!(
            AttachReport::inspect(&[7, 7, 7], 7),
            AttachReport::Verified { len: 3 }
        );
        assert_eq!(
            AttachReport::inspect(&[7, 7, 1, 0], 7),
            AttachReport::Mismatch {
                offset: 2,
                expected: 7,
                found: 1
            }
        );
    }

    #[test]
    fn only_verified_counts_as_success() {
        assert!(AttachReport::Verified { len: 0 }.is_verified());
        assert!(!AttachReport::Failed("boom".to_string()).is_verified());
    }
}
