use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Read, Write};

/// A 128-bit GUID in the canonical `data1-data2-data3-data4` layout used on the wire
/// by `GetNodeInfo` / `QueryInterface`. Wire order is big-endian for the first three
/// fields and raw bytes for the last eight, matching the source protocol exactly.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl Guid {
    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Guid {
        Guid { data1, data2, data3, data4 }
    }

    #[inline]
    pub fn read<R: Read>(mut stream: R) -> io::Result<Guid> {
        let data1 = stream.read_u32::<BigEndian>()?;
        let data2 = stream.read_u16::<BigEndian>()?;
        let data3 = stream.read_u16::<BigEndian>()?;
        let mut data4 = [0u8; 8];
        stream.read_exact(&mut data4)?;
        Ok(Guid { data1, data2, data3, data4 })
    }

    #[inline]
    pub fn write<W: Write>(&self, mut stream: W) -> io::Result<()> {
        stream.write_u32::<BigEndian>(self.data1)?;
        stream.write_u16::<BigEndian>(self.data2)?;
        stream.write_u16::<BigEndian>(self.data3)?;
        stream.write_all(&self.data4)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

/// Frozen well-known identity of the master node, handed out to every network.
pub const MASTER_GUID: Guid = Guid::from_fields(
    0x554C_0A67,
    0xF228,
    0x47B5,
    [0x81, 0x55, 0x8C, 0x54, 0x36, 0xD5, 0x33, 0xDA],
);

/// Frozen well-known identity of every router node.
pub const ROUTER_GUID: Guid = Guid::from_fields(
    0xA1EE_332D,
    0x5C7C,
    0x42FE,
    [0x95, 0x19, 0x54, 0xBD, 0xAC, 0x40, 0xCF, 0x21],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_canonical_form() {
        assert_eq!(MASTER_GUID.to_string(), "554C0A67-F228-47B5-8155-8C5436D533DA");
        assert_eq!(ROUTER_GUID.to_string(), "A1EE332D-5C7C-42FE-9519-54BDAC40CF21");
    }

    #[test]
    fn round_trips_over_a_stream() {
        let mut buf = Vec::new();
        MASTER_GUID.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 16);

        let decoded = Guid::read(&buf[..]).unwrap();
        assert_eq!(decoded, MASTER_GUID);
    }
}
