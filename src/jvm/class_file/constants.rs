use super::{Attribute, AttributeLike, Serialize};
use crate::jvm::Error;
use byteorder::WriteBytesExt;
use std::collections::HashMap;

/// Access to the constant pool of the class whose method is being generated
///
/// Method bodies need constants for the class names that show up in stack map frames and in
/// exception handlers, and for the names of the attributes they produce. Everything else is
/// already resolved to an index by the caller before it reaches the code generator.
pub trait ClassConstants {
    /// Get or insert a `CONSTANT_Class` for a binary name (or an array descriptor)
    fn class_index(&mut self, name: &str) -> Result<ClassConstantIndex, ConstantPoolOverflow>;

    /// Get or insert a `CONSTANT_Utf8`
    fn utf8_index(&mut self, text: &str) -> Result<Utf8ConstantIndex, ConstantPoolOverflow>;

    /// Serialize an attribute and pair it with its name
    fn attribute<A: AttributeLike>(&mut self, attribute: A) -> Result<Attribute, Error> {
        let name_index = self.utf8_index(A::NAME)?;
        let mut info = vec![];

        attribute.serialize(&mut info).map_err(Error::IoError)?;

        Ok(Attribute { name_index, info })
    }
}

/// Minimal constants pool builder
///
/// The pool is append only and deduplicates entries. It only knows about the constants method
/// bodies ask for through [`ClassConstants`].
#[derive(Debug, Default)]
pub struct ConstantsPool {
    constants: Vec<Constant>,
    classes: HashMap<Utf8ConstantIndex, ClassConstantIndex>,
    utf8s: HashMap<String, Utf8ConstantIndex>,
}

impl ConstantsPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantsPool {
        ConstantsPool::default()
    }

    /// Push a constant into the constant pool, provided there is space for it
    ///
    /// Note: indexing starts at 1 and the count of constants (plus one) must fit in a `u16`.
    fn push_constant(&mut self, constant: Constant) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let offset = self.constants.len() + 1;
        match u16::try_from(offset) {
            Ok(offset) if offset < u16::MAX => {
                self.constants.push(constant);
                Ok(ConstantIndex(offset))
            }
            _ => Err(ConstantPoolOverflow {
                constant,
                offset: u16::MAX,
            }),
        }
    }

    /// Look up the constant at an index
    pub fn get(&self, index: ConstantIndex) -> Option<&Constant> {
        (index.0 as usize)
            .checked_sub(1)
            .and_then(|idx| self.constants.get(idx))
    }

    /// Number of constants in the pool
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }
}

impl ClassConstants for ConstantsPool {
    fn class_index(&mut self, name: &str) -> Result<ClassConstantIndex, ConstantPoolOverflow> {
        let name_index = self.utf8_index(name)?;
        if let Some(idx) = self.classes.get(&name_index) {
            Ok(*idx)
        } else {
            let idx = ClassConstantIndex(self.push_constant(Constant::Class(name_index))?);
            self.classes.insert(name_index, idx);
            Ok(idx)
        }
    }

    fn utf8_index(&mut self, text: &str) -> Result<Utf8ConstantIndex, ConstantPoolOverflow> {
        if let Some(idx) = self.utf8s.get(text) {
            Ok(*idx)
        } else {
            let constant = Constant::Utf8(text.to_owned());
            let idx = Utf8ConstantIndex(self.push_constant(constant)?);
            self.utf8s.insert(text.to_owned(), idx);
            Ok(idx)
        }
    }
}

/// The count is one more than the number of entries
impl Serialize for ConstantsPool {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        (self.constants.len() as u16 + 1).serialize(writer)?;
        for constant in &self.constants {
            constant.serialize(writer)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConstantPoolOverflow {
    pub constant: Constant,
    pub offset: u16,
}

/// Constants as in the constant pool
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    /// Class or an interface
    Class(Utf8ConstantIndex),

    /// Modified UTF-8 string
    Utf8(String),
}

impl Serialize for Constant {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Constant::Class(name) => {
                7u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::Utf8(string) => {
                let bytes = modified_utf8(string);
                1u8.serialize(writer)?;
                (bytes.len() as u16).serialize(writer)?;
                writer.write_all(&bytes)?;
            }
        }
        Ok(())
    }
}

/// Encode a string the way class files do: `\0` takes two bytes and characters outside the BMP
/// are written as surrogate pairs of three bytes each
fn modified_utf8(string: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(string.len());
    for c in string.chars() {
        match c as u32 {
            0 => bytes.extend_from_slice(&[0xc0, 0x80]),
            0x01..=0xffff => {
                let mut buf = [0; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            _ => {
                let mut units = [0; 2];
                for unit in c.encode_utf16(&mut units).iter() {
                    bytes.push(0xe0 | (unit >> 12) as u8);
                    bytes.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                    bytes.push(0x80 | (unit & 0x3f) as u8);
                }
            }
        }
    }
    bytes
}

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct ConstantIndex(pub u16);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct Utf8ConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct ClassConstantIndex(pub ConstantIndex);

impl Serialize for ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Serialize for Utf8ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Serialize for ClassConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deduplicates() {
        let mut pool = ConstantsPool::new();
        let string1 = pool.class_index("java/lang/String").unwrap();
        let object = pool.class_index("java/lang/Object").unwrap();
        let string2 = pool.class_index("java/lang/String").unwrap();
        let utf8 = pool.utf8_index("java/lang/String").unwrap();

        assert_eq!(string1, string2);
        assert_ne!(string1, object);
        assert_eq!(pool.len(), 4);
        assert_eq!(utf8, Utf8ConstantIndex(ConstantIndex(1)));
        assert_eq!(pool.get(string1.0), Some(&Constant::Class(utf8)));
        assert_eq!(pool.get(ConstantIndex(0)), None);
    }

    #[test]
    fn modified_utf8_encoding() {
        assert_eq!(modified_utf8("a\0"), vec![b'a', 0xc0, 0x80]);
        assert_eq!(modified_utf8("é"), "é".as_bytes());
        assert_eq!(
            modified_utf8("\u{1F600}"),
            vec![0xed, 0xa0, 0xbd, 0xed, 0xb8, 0x80]
        );
    }

    #[test]
    fn serialized_pool() {
        let mut pool = ConstantsPool::new();
        pool.class_index("A").unwrap();

        let mut out: Vec<u8> = vec![];
        pool.serialize(&mut out).unwrap();
        assert_eq!(out, vec![0, 3, 1, 0, 1, b'A', 7, 0, 1]);
    }
}
