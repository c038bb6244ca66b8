use std::borrow::Cow;
use std::fmt::{Debug, Display, Error as FmtError, Formatter};

/// Names of local variables (and of methods and fields)
///
/// See <https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.2.2>
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct UnqualifiedName(Cow<'static, str>);

/// Names of classes and interfaces
///
/// See <https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.2.1>
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct BinaryName(Cow<'static, str>);

/// Extracts the raw underlying string name
impl AsRef<str> for UnqualifiedName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

/// Extracts the raw underlying string name
impl AsRef<str> for BinaryName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

pub trait Name: Sized {
    /// Check if a string would be a valid name
    fn check_valid(name: impl AsRef<str>) -> Result<(), String>;

    /// Extact the raw underlying string data:
    fn as_cow(&self) -> &Cow<'static, str>;

    /// Extact the raw underlying string name
    fn as_str(&self) -> &str {
        self.as_cow().as_ref()
    }

    /// Try to construct a name from a string
    fn from_string(name: String) -> Result<Self, String>;
}

impl Name for UnqualifiedName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), String> {
        let name = name.as_ref();
        if name.contains(&['.', ';', '[', '/'][..]) {
            Err(format!(
                "Unqualified name '{}' contains an illegal character",
                name
            ))
        } else if name.is_empty() {
            Err(format!("Unqualified name '{}' is empty", name))
        } else {
            Ok(())
        }
    }

    fn as_cow(&self) -> &Cow<'static, str> {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, String> {
        match Self::check_valid(&name) {
            Ok(()) => Ok(UnqualifiedName(Cow::Owned(name))),
            Err(msg) => Err(msg),
        }
    }
}

impl Name for BinaryName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), String> {
        let name = name.as_ref();
        if name.is_empty() {
            Err(format!("Binary name '{}' is empty", name))
        } else {
            name.split('/').map(UnqualifiedName::check_valid).collect()
        }
    }

    fn as_cow(&self) -> &Cow<'static, str> {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, String> {
        match Self::check_valid(&name) {
            Ok(()) => Ok(BinaryName(Cow::Owned(name))),
            Err(msg) => Err(msg),
        }
    }
}

impl std::str::FromStr for UnqualifiedName {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, String> {
        UnqualifiedName::from_string(name.to_owned())
    }
}

impl std::str::FromStr for BinaryName {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, String> {
        BinaryName::from_string(name.to_owned())
    }
}

impl Debug for UnqualifiedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Debug for BinaryName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Display for UnqualifiedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Display for BinaryName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl BinaryName {
    const fn name(value: &'static str) -> BinaryName {
        BinaryName(Cow::Borrowed(value))
    }

    // JDK names
    pub const CLASS: Self = Self::name("java/lang/Class");
    pub const OBJECT: Self = Self::name("java/lang/Object");
    pub const STRING: Self = Self::name("java/lang/String");
    pub const THROWABLE: Self = Self::name("java/lang/Throwable");
}

/// Shape of a field descriptor, as far as verification cares
///
/// `Z`, `B`, `C`, `S`, and `I` all collapse into [`DescriptorShape::Integer`] since the verifier
/// does not distinguish between them.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DescriptorShape<'a> {
    Integer,
    Float,
    Long,
    Double,

    /// Class or interface (the binary name, without the `L` and `;`)
    Object(&'a str),

    /// Array (the entire descriptor, including the leading `[`)
    Array(&'a str),
}

impl<'a> DescriptorShape<'a> {
    /// Parse a complete field descriptor
    ///
    /// See <https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.3.2>
    pub fn parse(descriptor: &'a str) -> Result<DescriptorShape<'a>, String> {
        let element = descriptor.trim_start_matches('[');
        let dimensions = descriptor.len() - element.len();
        if dimensions > 255 {
            return Err(format!(
                "Descriptor '{}' has more than 255 array dimensions",
                descriptor
            ));
        }

        let element_shape = match element {
            "Z" | "B" | "C" | "S" | "I" => DescriptorShape::Integer,
            "F" => DescriptorShape::Float,
            "J" => DescriptorShape::Long,
            "D" => DescriptorShape::Double,
            _ => match element
                .strip_prefix('L')
                .and_then(|rest| rest.strip_suffix(';'))
            {
                Some(class_name) => {
                    BinaryName::check_valid(class_name)?;
                    DescriptorShape::Object(class_name)
                }
                None => return Err(format!("Invalid field descriptor '{}'", descriptor)),
            },
        };

        if dimensions == 0 {
            Ok(element_shape)
        } else {
            Ok(DescriptorShape::Array(descriptor))
        }
    }
}
