use std::fmt;
use std::str::FromStr;

use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::types::IPC_HANDLE_SIZE;
use crate::Error;

/// Defines an opaque, fixed-size IPC handle type.
///
/// Handles print and parse as lowercase hex and serialize as a hex string,
/// so they can travel over any text or serde transport unchanged.
macro_rules! ipc_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name([u8; IPC_HANDLE_SIZE]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; IPC_HANDLE_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = Error;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                let bytes: [u8; IPC_HANDLE_SIZE] = bytes.try_into().map_err(|_| {
                    Error::InvalidHandle(format!(
                        "expected {} bytes, got {}",
                        IPC_HANDLE_SIZE,
                        bytes.len()
                    ))
                })?;
                Ok(Self(bytes))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s.trim())
                    .map_err(|e| Error::InvalidHandle(e.to_string()))?;
                Self::try_from(bytes.as_slice())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let hex = String::deserialize(deserializer)?;
                hex.parse().map_err(de::Error::custom)
            }
        }
    };
}

ipc_handle! {
    /// Handle to a region of device memory that another process can map.
    MemoryHandle
}

ipc_handle! {
    /// Handle to an interprocess event that another process can open.
    EventHandle
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn sample() -> [u8; IPC_HANDLE_SIZE] {
        let mut bytes = [0u8; IPC_HANDLE_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i * 7) as u8;
        }
        bytes
    }

    #[test]
    fn hex_form_is_lowercase_and_full_length() {
        let handle = MemoryHandle::from_bytes(sample());
        let hex = handle.to_string();

        assert_eq!(hex.len(), IPC_HANDLE_SIZE * 2);
        assert!(hex.starts_with("00070e15"));
        assert_eq!(hex.parse::<MemoryHandle>().unwrap(), handle);
    }

    #[test]
    fn rejects_short_and_malformed_hex() {
        let short = "abcd".parse::<EventHandle>().unwrap_err();
        assert!(matches!(short, Error::InvalidHandle(msg) if msg == "expected 64 bytes, got 2"));

        let garbage = "zz".repeat(IPC_HANDLE_SIZE).parse::<EventHandle>();
        assert!(matches!(garbage, Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn serializes_as_hex_string() {
        let handle = EventHandle::from_bytes(sample());
        let json = serde_json::to_string(&handle).unwrap();

        assert_eq!(json, format!("\"{}\"", handle.to_hex()));
        let back: EventHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
    }

    #[test]
    fn debug_names_the_handle_kind() {
        let handle = MemoryHandle::from_bytes([0xab; IPC_HANDLE_SIZE]);
        assert!(format!("{handle:?}").starts_with("MemoryHandle(abab"));
    }
}
