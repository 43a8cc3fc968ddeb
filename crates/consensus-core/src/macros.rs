/// Define a fixed-size byte array newtype with the usual conversions
macro_rules! bytes_type_define {
    (
        $(#[$outer:meta])*
        $v:vis struct $name:ident[$n:expr];
    ) => {
        $(#[$outer])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ::bincode::Encode, ::bincode::Decode)]
        $v struct $name([u8; $n]);

        impl $name {
            pub const LEN: usize = $n;
            pub const ZERO: Self = Self([0u8; $n]);

            pub const fn from_bytes(bytes: [u8; $n]) -> Self {
                Self(bytes)
            }

            pub fn to_bytes(self) -> [u8; $n] {
                self.0
            }

            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::ZERO
            }
        }

        impl From<[u8; $n]> for $name {
            fn from(value: [u8; $n]) -> Self {
                Self(value)
            }
        }
    };
}

/// Base32 `Display`/`FromStr`, `Debug` as `Display`, and serde
///
/// Human readable serde formats get the base32 string, binary ones raw bytes.
macro_rules! bytes_type_impl_display {
    ($name:ident) => {
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                data_encoding::BASE32_DNSCURVE.encode_write(self.as_slice(), f)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                <Self as std::fmt::Display>::fmt(self, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = data_encoding::DecodeError;

            fn from_str(s: &str) -> Result<$name, Self::Err> {
                let v = data_encoding::BASE32_DNSCURVE.decode(s.as_bytes())?;
                let a = v.try_into().map_err(|_| data_encoding::DecodeError {
                    position: 0,
                    kind: data_encoding::DecodeKind::Length,
                })?;
                Ok(Self(a))
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: ::serde::Serializer,
            {
                if s.is_human_readable() {
                    s.serialize_str(&self.to_string())
                } else {
                    s.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D>(d: D) -> Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                if d.is_human_readable() {
                    let str = <String>::deserialize(d)?;
                    <Self as std::str::FromStr>::from_str(&str).map_err(|e| {
                        ::serde::de::Error::custom(format!("Deserialization error: {e:#}"))
                    })
                } else {
                    let bytes = <serde_bytes::ByteArray<{ $name::LEN }>>::deserialize(d)?;
                    Ok(Self(bytes.into_array()))
                }
            }
        }
    };
}

/// Define a monotonic counter newtype (view numbers, sequence numbers)
macro_rules! number_type_define {
    (
        $(#[$outer:meta])*
        $v:vis struct $name:ident($t:ty);
    ) => {
        $(#[$outer])*
        #[derive(
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::bincode::Encode,
            ::bincode::Decode,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        $v struct $name($t);

        impl $name {
            pub const ZERO: Self = Self(0);
            pub const MAX: Self = Self(<$t>::MAX);

            pub const fn new(t: $t) -> Self {
                Self(t)
            }

            pub const fn to_number(self) -> $t {
                self.0
            }

            pub fn next(self) -> Option<Self> {
                self.0.checked_add(1).map(Self)
            }

            pub fn next_expect(self) -> Self {
                Self(self.0.checked_add(1).expect("Can't run out of u64 numbers"))
            }

            pub fn prev(self) -> Option<Self> {
                self.0.checked_sub(1).map(Self)
            }
        }

        impl From<$t> for $name {
            fn from(value: $t) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $t {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                <Self as std::fmt::Display>::fmt(self, f)
            }
        }
    };
}
