use crate::error::{EscrowError, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

fn decode_fixed<const N: usize>(s: &str, what: &str) -> Result<[u8; N]> {
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(hex_str)
        .map_err(|_| EscrowError::InvalidArgument(format!("malformed {}: '{}'", what, s)))?;
    if bytes.len() != N {
        return Err(EscrowError::InvalidArgument(format!(
            "invalid {} length: expected {} bytes, got {}",
            what,
            N,
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

macro_rules! hex_newtype {
    ($name:ident, $len:expr, $what:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = EscrowError;

            fn from_str(s: &str) -> Result<Self> {
                decode_fixed::<$len>(s, $what).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_newtype!(WalletAddress, 20, "wallet address");
hex_newtype!(ContractAddress, 20, "contract address");
