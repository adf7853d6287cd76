//! Conversion of register values and wire structures to and from little endian bytes.

use core::{
    marker::PhantomData,
    fmt,
    };

/**
    value with a fixed size representation in a datagram

    Every register and every structure read from a slave implements this, so it can be read or written with a [Field] or a [Cursor]
*/
pub trait PduData: Sized {
    /// byte array holding the packed value
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_size() -> usize  {Self::Packed::LEN}
}

/// failure to convert a value to or from bytes
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PackingError {
    /// the buffer has not the expected size, the size found is given
    BadSize(usize, &'static str),
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;


/// fixed size byte array, generic consts cannot yet be used in const expressions so the length is an associated constant
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    fn zeroed() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn zeroed() -> Self  {[0; N]}
}

impl<const N: usize> PduData for [u8; N] {
    type Packed = Self;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        let len = dst.len();
        dst.get_mut(.. N)
            .ok_or(PackingError::BadSize(len, "buffer shorter than array"))?
            .copy_from_slice(self);
        Ok(())
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        src.get(.. N)
            .and_then(|src| Self::try_from(src).ok())
            .ok_or(PackingError::BadSize(src.len(), "buffer shorter than array"))
    }
}

impl PduData for () {
    type Packed = [u8; 0];

    fn pack(&self, _dst: &mut [u8]) -> PackingResult<()>  {Ok(())}
    fn unpack(_src: &[u8]) -> PackingResult<Self>  {Ok(())}
}

/**
    implement [PduData] for a `bilge` bitfield whose backing integer is `$id`

    the bitfield is transmuted from and to its little endian bytes, so it must derive `FromBits`: any bit pattern has to be a valid value
*/
macro_rules! bilge_pdudata {
    ($t: ty, $id: ident) => { impl crate::data::PduData for $t {
        type Packed = [u8; ($id::BITS as usize + 7)/8];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            use crate::data::Storage;
            let len = dst.len();
            let dst = dst.get_mut(.. Self::Packed::LEN)
                .ok_or(crate::data::PackingError::BadSize(len, "buffer shorter than bitfield"))?;
            dst.copy_from_slice(&unsafe {core::mem::transmute_copy::<$t, Self::Packed>(self)});
            Ok(())
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            use crate::data::Storage;
            let src = src.get(.. Self::Packed::LEN)
                .ok_or(crate::data::PackingError::BadSize(src.len(), "buffer shorter than bitfield"))?;
            let mut padded = [0; core::mem::size_of::<$t>()];
            padded[.. Self::Packed::LEN].copy_from_slice(src);
            Ok(unsafe {core::mem::transmute::<[u8; core::mem::size_of::<$t>()], $t>(padded)})
        }
    }};
}
pub(crate) use bilge_pdudata;

/// implement [PduData] for a `repr(packed)` struct of little endian fields, any bit pattern must be a valid value
macro_rules! packed_pdudata {
    ($t: ty) => { impl crate::data::PduData for $t {
        type Packed = [u8; core::mem::size_of::<$t>()];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            let packed = unsafe {core::mem::transmute_copy::<$t, Self::Packed>(self)};
            crate::data::PduData::pack(&packed, dst)
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            let src = <Self::Packed as crate::data::PduData>::unpack(src)?;
            Ok(unsafe {core::mem::transmute::<Self::Packed, $t>(src)})
        }
    }};
}
pub(crate) use packed_pdudata;

macro_rules! num_pdudata {
    ($($t: ty),*) => {$( impl PduData for $t {
        type Packed = [u8; core::mem::size_of::<$t>()];

        fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
            self.to_le_bytes().pack(dst)
        }
        fn unpack(src: &[u8]) -> PackingResult<Self> {
            Ok(Self::from_le_bytes(<[u8; core::mem::size_of::<$t>()]>::unpack(src)?))
        }
    })*};
}
num_pdudata!(u8, u16, u32, u64);



/**
    location of a value of type `T` in a byte sequence: a register in the slave memory, or a field in a structure read from the wire

    It holds no data, only the byte offset and length, and checks the bounds when reading or writing a buffer.
*/
#[derive(Default, Eq, Hash)]
pub struct Field<T: PduData> {
    extracted: PhantomData<T>,
    /// offset of the first byte
    pub byte: usize,
    /// number of bytes
    pub len: usize,
}
impl<T: PduData> Field<T> {
    pub const fn new(byte: usize, len: usize) -> Self {
        Self {extracted: PhantomData, byte, len}
    }
    /// field at the given offset, with the packed size of `T`
    pub const fn simple(byte: usize) -> Self {
        Self {extracted: PhantomData, byte, len: T::Packed::LEN}
    }

    pub fn get(&self, data: &[u8]) -> PackingResult<T> {
        T::unpack(data.get(self.byte .. self.byte + self.len)
            .ok_or(PackingError::BadSize(data.len(), "field out of buffer"))?)
    }
    pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()> {
        let len = data.len();
        value.pack(data.get_mut(self.byte .. self.byte + self.len)
            .ok_or(PackingError::BadSize(len, "field out of buffer"))?)
    }
}
impl<T: PduData> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field {{{:#x}, {}}}", self.byte, self.len)
    }
}
// not derived, `T` itself does not need to be copiable
impl<T: PduData> Clone for Field<T> {
    fn clone(&self) -> Self  {*self}
}
impl<T: PduData> Copy for Field<T> {}
impl<T: PduData> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        self.byte == other.byte && self.len == other.len
    }
}



/**
    sequential reader or writer over a byte slice

    Unlike [std::io::Cursor], reads borrow the underlying slice instead of copying, and values are read and written as [PduData]
*/
pub struct Cursor<T> {
    position: usize,
    data: T,
}
impl<T> Cursor<T> {
    pub fn new(data: T) -> Self  {Self {position: 0, data}}
}
impl<'a> Cursor<&'a [u8]> {
    pub fn unpack<T: PduData>(&mut self) -> PackingResult<T> {
        let value = T::unpack(self.remain())?;
        self.position += T::Packed::LEN;
        Ok(value)
    }
    /// the next `size` bytes
    pub fn read(&mut self, size: usize) -> PackingResult<&'a [u8]> {
        let data: &'a [u8] = self.data;
        let read = data.get(self.position .. self.position + size)
            .ok_or(PackingError::BadSize(data.len().saturating_sub(self.position), "not enough bytes remaining"))?;
        self.position += size;
        Ok(read)
    }
    /// bytes not read yet, the position is unchanged
    pub fn remain(&self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        data.get(self.position ..).unwrap_or_default()
    }
}
impl<'a> Cursor<&'a mut [u8]> {
    pub fn pack<T: PduData>(&mut self, value: &T) -> PackingResult<()> {
        value.pack(self.remain())?;
        self.position += T::Packed::LEN;
        Ok(())
    }
    pub fn write(&mut self, value: &[u8]) -> PackingResult<()> {
        let available = self.data.len().saturating_sub(self.position);
        self.data.get_mut(self.position .. self.position + value.len())
            .ok_or(PackingError::BadSize(available, "not enough space remaining"))?
            .copy_from_slice(value);
        self.position += value.len();
        Ok(())
    }
    /// space not written yet, the position is unchanged
    pub fn remain(&mut self) -> &'_ mut [u8] {
        let position = self.position.min(self.data.len());
        &mut self.data[position ..]
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields() {
        let mut buffer = [0u8; 8];
        let word = Field::<u16>::simple(2);
        word.set(&mut buffer, 0x1234).unwrap();
        assert_eq!(buffer, [0, 0, 0x34, 0x12, 0, 0, 0, 0]);
        assert_eq!(word.get(&buffer).unwrap(), 0x1234);
        assert!(Field::<u32>::simple(6).get(&buffer).is_err());
        assert!(Field::<u64>::simple(1).set(&mut buffer, 0).is_err());
    }

    #[test]
    fn cursors() {
        let mut buffer = [0u8; 6];
        let mut cursor = Cursor::new(&mut buffer[..]);
        cursor.pack(&0xabcdu16).unwrap();
        cursor.write(&[1, 2, 3]).unwrap();
        assert_eq!(cursor.remain().len(), 1);
        assert!(cursor.write(&[4, 5]).is_err());

        let mut cursor = Cursor::new(&buffer[..]);
        assert_eq!(cursor.unpack::<u16>().unwrap(), 0xabcd);
        assert_eq!(cursor.read(3).unwrap(), [1, 2, 3]);
        assert!(cursor.read(2).is_err());
        assert_eq!(cursor.remain(), [0]);
    }
}
