//! # FEC header wire format
//!
//! Pro-MPEG CoP#3r2 / RFC 2733 FEC header, 16 bytes, network byte order:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      SN base low bits        |        Length recovery        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |E| PT recovery |                  mask                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         TS recovery                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |X|D|   type  |  index  |       L       |    na_bits (D/L)      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  sn_base_ext  |
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! Only `type=XOR(0)`, `X=0`, `E=1`, `index=0`, `mask=0`, `sn_base_ext=0` are
//! produced by any head-end this core talks to; `FecHeader::decode` rejects
//! anything else rather than attempt to interpret it.

use bytes::{Buf, BufMut};

/// On-wire size of a FEC header.
pub const FEC_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecHeaderError {
    TooShort,
    UnsupportedType,
    XBitSet,
    EBitClear,
    NonzeroIndex,
    NonzeroMask,
    NonzeroSnBaseExt,
}

/// Which axis of a 2-D FEC matrix a packet protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecAxis {
    /// D-bit clear: protects primaries spaced `L` apart (the matrix column).
    Column,
    /// D-bit set, offset == 1: protects `L` contiguous primaries (the row).
    Row,
}

/// A decoded Pro-MPEG CoP#3r2 FEC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecHeader {
    pub sn_base_low_bits: u16,
    pub length_recovery: u16,
    pub pt_recovery: u8,
    pub ts_recovery: u32,
    pub axis: FecAxis,
    /// Column: `L`. Row: `1`.
    pub offset: u8,
    /// Column: `D`. Row: `L`.
    pub na_bits: u8,
}

impl FecHeader {
    pub fn decode(buf: &mut impl Buf) -> Result<Self, FecHeaderError> {
        if buf.remaining() < FEC_HEADER_LEN {
            return Err(FecHeaderError::TooShort);
        }

        let sn_base_low_bits = buf.get_u16();
        let length_recovery = buf.get_u16();

        let word = buf.get_u32();
        let e_bit = (word >> 31) & 1;
        let pt_recovery = ((word >> 24) & 0x7F) as u8;
        let mask = word & 0x00FF_FFFF;

        let ts_recovery = buf.get_u32();

        let flags = buf.get_u8();
        let x_bit = (flags >> 7) & 1;
        let d_bit = (flags >> 6) & 1;
        let fec_type = (flags >> 3) & 0x7;
        let index = flags & 0x7;

        let l = buf.get_u8();
        let na_bits = buf.get_u8();
        let sn_base_ext = buf.get_u8();

        if fec_type != 0 {
            return Err(FecHeaderError::UnsupportedType);
        }
        if x_bit != 0 {
            return Err(FecHeaderError::XBitSet);
        }
        if e_bit != 1 {
            return Err(FecHeaderError::EBitClear);
        }
        if index != 0 {
            return Err(FecHeaderError::NonzeroIndex);
        }
        if mask != 0 {
            return Err(FecHeaderError::NonzeroMask);
        }
        if sn_base_ext != 0 {
            return Err(FecHeaderError::NonzeroSnBaseExt);
        }

        let axis = if d_bit == 0 {
            FecAxis::Column
        } else {
            FecAxis::Row
        };

        Ok(FecHeader {
            sn_base_low_bits,
            length_recovery,
            pt_recovery,
            ts_recovery,
            axis,
            offset: l,
            na_bits,
        })
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.sn_base_low_bits);
        buf.put_u16(self.length_recovery);

        let word = (1u32 << 31) | ((self.pt_recovery as u32 & 0x7F) << 24);
        buf.put_u32(word);
        buf.put_u32(self.ts_recovery);

        let d_bit = match self.axis {
            FecAxis::Column => 0u8,
            FecAxis::Row => 1u8,
        };
        buf.put_u8(d_bit << 6); // X=0, type=0, index=0
        buf.put_u8(self.offset);
        buf.put_u8(self.na_bits);
        buf.put_u8(0); // sn_base_ext
    }

    /// `L` as the FEC matrix knows it, regardless of axis.
    pub fn l(&self) -> u8 {
        match self.axis {
            FecAxis::Column => self.offset,
            FecAxis::Row => self.na_bits,
        }
    }

    /// `D` as the FEC matrix knows it, regardless of axis.
    pub fn d(&self) -> u8 {
        match self.axis {
            FecAxis::Column => self.na_bits,
            FecAxis::Row => self.offset,
        }
    }
}
