use bincode::config::{self, Config};
use bincode::{de, error};

pub const LIMIT_16M: usize = 0x100_0000;

/// Encoding used for everything that gets hashed, signed or sent over the wire
pub const CONSENSUS_BINCODE_CONFIG: config::Configuration<
    config::BigEndian,
    config::Varint,
    config::Limit<LIMIT_16M>,
> = config::standard()
    .with_limit::<LIMIT_16M>()
    .with_big_endian()
    .with_variable_int_encoding();

/// Decode `src`, failing if any bytes are left over
pub fn decode_whole<D: de::Decode<()>, C: Config>(
    src: &[u8],
    config: C,
) -> Result<D, error::DecodeError> {
    let (t, consumed) = bincode::decode_from_slice(src, config)?;

    if consumed != src.len() {
        return Err(error::DecodeError::Other("leftover bytes"));
    }

    Ok(t)
}
