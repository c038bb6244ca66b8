use crate::jvm::class_file::{ClassConstants, VerificationTypeInfo};
use crate::jvm::{BinaryName, DescriptorShape, Error, Name};
use elsa::map::FrozenMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use typed_arena::Arena;

/// Interned verification type
pub type VType<'g> = &'g VerificationType<'g>;

/// What distinguishes one verification type from another
///
/// These types are from [this hierarchy][0], plus `Top` as the root.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se7/html/jvms-4.html#jvms-4.10.1.2
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum TypeKind {
    /// Root of the hierarchy, also used for unassigned locals and the second slot of wide locals
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,

    /// In the constructor, the `this` parameter starts with this type then turns into an object
    /// type after `<init>` is called
    UninitializedThis,

    /// State of an object after `new` has been called but `<init>` has not been called (the
    /// payload is the offset of the `new` instruction)
    Uninitialized(u16),

    /// Class or interface type
    Object(BinaryName),

    /// Array type (the payload is the full descriptor, eg. `[Ljava/lang/String;`)
    Array(String),
}

/// Node in the verification type lattice
///
/// Nodes are only ever created by [`TypeLattice`], which interns them so that there is at most
/// one node per [`TypeKind`]. Equality and hashing only look at the kind.
pub struct VerificationType<'g> {
    kind: TypeKind,

    /// Only `Top` has no supertype
    supertype: Option<VType<'g>>,

    /// Number of supertype edges between this type and `Top`
    depth: usize,
}

impl<'g> VerificationType<'g> {
    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    pub fn supertype(&self) -> Option<VType<'g>> {
        self.supertype
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_top(&self) -> bool {
        self.kind == TypeKind::Top
    }

    pub fn is_null(&self) -> bool {
        self.kind == TypeKind::Null
    }

    /// Is this a `long` or `double`?
    pub fn is_two_word(&self) -> bool {
        matches!(self.kind, TypeKind::Long | TypeKind::Double)
    }

    /// Number of local slots or stack words a value of this type takes
    pub fn size(&self) -> usize {
        if self.is_two_word() {
            2
        } else {
            1
        }
    }

    /// Is this a class, interface, or array type (ie. something assignable to `Object`)?
    fn is_object_like(&self) -> bool {
        matches!(self.kind, TypeKind::Object(_) | TypeKind::Array(_))
    }

    /// Field descriptor of the type, if it has one
    pub fn descriptor(&self) -> Option<String> {
        match &self.kind {
            TypeKind::Integer => Some(String::from("I")),
            TypeKind::Float => Some(String::from("F")),
            TypeKind::Long => Some(String::from("J")),
            TypeKind::Double => Some(String::from("D")),
            TypeKind::Object(name) => Some(format!("L{};", name)),
            TypeKind::Array(descriptor) => Some(descriptor.clone()),
            _ => None,
        }
    }

    /// Check if this type is assignable to another
    ///
    /// This holds when `super_type` is this type or one of its ancestors. The null type is
    /// additionally assignable to every class, interface, and array type.
    pub fn is_assignable(&self, super_type: &VerificationType<'g>) -> bool {
        if self == super_type || (self.is_null() && super_type.is_object_like()) {
            return true;
        }

        let mut ancestor = self.supertype;
        while let Some(t) = ancestor {
            if t == super_type {
                return true;
            }
            ancestor = t.supertype;
        }

        false
    }

    /// Find the most specific type which both types are assignable to
    ///
    /// The deeper type first walks up until both are at the same depth, then both walk up in
    /// lockstep until they meet. This always terminates since `Top` is the root of every chain.
    pub fn nearest_common_ancestor(first: VType<'g>, second: VType<'g>) -> VType<'g> {
        if first == second {
            return first;
        }
        if second.is_null() && first.is_object_like() {
            return first;
        }
        if first.is_null() && second.is_object_like() {
            return second;
        }

        let mut x = first;
        let mut y = second;
        while x.depth > y.depth {
            match x.supertype {
                Some(t) => x = t,
                None => break,
            }
        }
        while y.depth > x.depth {
            match y.supertype {
                Some(t) => y = t,
                None => break,
            }
        }
        while x != y {
            match (x.supertype, y.supertype) {
                (Some(t1), Some(t2)) => {
                    x = t1;
                    y = t2;
                }
                _ => break,
            }
        }
        x
    }

    /// Resolve the type into its serializable form
    pub fn into_serializable<C: ClassConstants>(
        &self,
        constants: &mut C,
    ) -> Result<VerificationTypeInfo, Error> {
        Ok(match &self.kind {
            TypeKind::Top => VerificationTypeInfo::Top,
            TypeKind::Integer => VerificationTypeInfo::Integer,
            TypeKind::Float => VerificationTypeInfo::Float,
            TypeKind::Long => VerificationTypeInfo::Long,
            TypeKind::Double => VerificationTypeInfo::Double,
            TypeKind::Null => VerificationTypeInfo::Null,
            TypeKind::UninitializedThis => VerificationTypeInfo::UninitializedThis,
            TypeKind::Uninitialized(offset) => VerificationTypeInfo::Uninitialized(*offset),
            TypeKind::Object(name) => {
                VerificationTypeInfo::Object(constants.class_index(name.as_str())?)
            }
            TypeKind::Array(descriptor) => {
                VerificationTypeInfo::Object(constants.class_index(descriptor)?)
            }
        })
    }
}

impl<'g> PartialEq for VerificationType<'g> {
    fn eq(&self, other: &VerificationType<'g>) -> bool {
        self.kind == other.kind
    }
}

impl<'g> Eq for VerificationType<'g> {}

impl<'g> Hash for VerificationType<'g> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state)
    }
}

impl<'g> fmt::Display for VerificationType<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TypeKind::Top => f.write_str("top"),
            TypeKind::Integer => f.write_str("int"),
            TypeKind::Float => f.write_str("float"),
            TypeKind::Long => f.write_str("long"),
            TypeKind::Double => f.write_str("double"),
            TypeKind::Null => f.write_str("null"),
            TypeKind::UninitializedThis => f.write_str("uninitializedThis"),
            TypeKind::Uninitialized(offset) => write!(f, "uninitialized({})", offset),
            TypeKind::Object(name) => f.write_str(name.as_str()),
            TypeKind::Array(descriptor) => f.write_str(descriptor),
        }
    }
}

impl<'g> fmt::Debug for VerificationType<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub struct TypeArenas<'g> {
    type_arena: Arena<VerificationType<'g>>,
}

impl<'g> TypeArenas<'g> {
    pub fn new() -> Self {
        TypeArenas {
            type_arena: Arena::new(),
        }
    }
}

impl<'g> Default for TypeArenas<'g> {
    fn default() -> Self {
        TypeArenas::new()
    }
}

/// Interned verification types and the supertype edges between them
///
/// Class types are related through their declared superclass (see [`TypeLattice::declare_class`]).
/// Classes that are only ever mentioned by name are assumed to extend `java/lang/Object`, which
/// is imprecise but keeps merges sound: the merge of two such classes is `java/lang/Object`.
///
/// Lookups borrow the lattice for `'g`, so the returned types can be stored in frames that
/// outlive the call.
pub struct TypeLattice<'g> {
    arenas: &'g TypeArenas<'g>,
    types: FrozenMap<TypeKind, &'g VerificationType<'g>>,

    top: VType<'g>,
    integer: VType<'g>,
    float: VType<'g>,
    long: VType<'g>,
    double: VType<'g>,
    null: VType<'g>,
    uninitialized_this: VType<'g>,
    object: VType<'g>,
    throwable: VType<'g>,
    string: VType<'g>,
    class: VType<'g>,
}

impl<'g> TypeLattice<'g> {
    /// New lattice containing the primitive types and a handful of `java/lang` classes
    pub fn new(arenas: &'g TypeArenas<'g>) -> Self {
        let types = FrozenMap::new();
        let alloc = |kind: TypeKind, supertype: Option<VType<'g>>| -> VType<'g> {
            let depth = supertype.map_or(0, |t| t.depth + 1);
            let node: VType<'g> = arenas.type_arena.alloc(VerificationType {
                kind: kind.clone(),
                supertype,
                depth,
            });
            types.insert(kind, node);
            node
        };

        let top = alloc(TypeKind::Top, None);
        let integer = alloc(TypeKind::Integer, Some(top));
        let float = alloc(TypeKind::Float, Some(top));
        let long = alloc(TypeKind::Long, Some(top));
        let double = alloc(TypeKind::Double, Some(top));
        let null = alloc(TypeKind::Null, Some(top));
        let uninitialized_this = alloc(TypeKind::UninitializedThis, Some(top));
        let object = alloc(TypeKind::Object(BinaryName::OBJECT), Some(top));
        let throwable = alloc(TypeKind::Object(BinaryName::THROWABLE), Some(object));
        let string = alloc(TypeKind::Object(BinaryName::STRING), Some(object));
        let class = alloc(TypeKind::Object(BinaryName::CLASS), Some(object));

        TypeLattice {
            arenas,
            types,
            top,
            integer,
            float,
            long,
            double,
            null,
            uninitialized_this,
            object,
            throwable,
            string,
            class,
        }
    }

    pub fn top(&self) -> VType<'g> {
        self.top
    }

    pub fn integer(&self) -> VType<'g> {
        self.integer
    }

    pub fn float(&self) -> VType<'g> {
        self.float
    }

    pub fn long(&self) -> VType<'g> {
        self.long
    }

    pub fn double(&self) -> VType<'g> {
        self.double
    }

    pub fn null(&self) -> VType<'g> {
        self.null
    }

    pub fn uninitialized_this(&self) -> VType<'g> {
        self.uninitialized_this
    }

    /// `java/lang/Object`
    pub fn object(&self) -> VType<'g> {
        self.object
    }

    /// `java/lang/Throwable`
    pub fn throwable(&self) -> VType<'g> {
        self.throwable
    }

    /// `java/lang/String`
    pub fn string(&self) -> VType<'g> {
        self.string
    }

    /// `java/lang/Class`
    pub fn class(&self) -> VType<'g> {
        self.class
    }

    /// Get or insert a node
    fn intern(&'g self, kind: TypeKind, supertype: VType<'g>) -> VType<'g> {
        if let Some(existing) = self.types.get(&kind) {
            return existing;
        }
        let node: VType<'g> = self.arenas.type_arena.alloc(VerificationType {
            kind: kind.clone(),
            supertype: Some(supertype),
            depth: supertype.depth + 1,
        });
        self.types.insert(kind, node);
        node
    }

    /// Declare a class along with its superclass
    ///
    /// Declaring the same class again is fine as long as the superclass is the same.
    pub fn declare_class(
        &'g self,
        name: BinaryName,
        superclass: VType<'g>,
    ) -> Result<VType<'g>, Error> {
        if !matches!(superclass.kind, TypeKind::Object(_)) {
            return Err(Error::InvalidDescriptor(format!(
                "Superclass of {} must be a class, not {}",
                name, superclass
            )));
        }

        let kind = TypeKind::Object(name.clone());
        if let Some(existing) = self.types.get(&kind) {
            return match existing.supertype {
                Some(existing_super) if existing_super == superclass => Ok(existing),
                other => Err(Error::ConflictingSupertype {
                    class: name,
                    existing: other.map_or(String::from("none"), |t| t.to_string()),
                    requested: superclass.to_string(),
                }),
            };
        }

        log::trace!("declaring {:?} with superclass {}", kind, superclass);
        Ok(self.intern(kind, superclass))
    }

    /// Get the type of a class
    ///
    /// If the class was never declared, it is interned with `java/lang/Object` as its superclass.
    pub fn class_type(&'g self, name: &BinaryName) -> VType<'g> {
        let kind = TypeKind::Object(name.clone());
        if let Some(existing) = self.types.get(&kind) {
            return existing;
        }
        self.intern(kind, self.object)
    }

    /// Get the type of an array from its descriptor
    ///
    /// The supertype of an array whose element type is a class or array type is the array of
    /// the element's supertype. Other arrays (primitive elements, or elements whose supertype is
    /// not a reference type) have `java/lang/Object` as their supertype.
    pub fn array_type(&'g self, descriptor: &str) -> Result<VType<'g>, Error> {
        match DescriptorShape::parse(descriptor).map_err(Error::InvalidDescriptor)? {
            DescriptorShape::Array(_) => (),
            _ => {
                return Err(Error::InvalidDescriptor(format!(
                    "'{}' is not an array descriptor",
                    descriptor
                )))
            }
        }

        let kind = TypeKind::Array(descriptor.to_owned());
        if let Some(existing) = self.types.get(&kind) {
            return Ok(existing);
        }

        let element = self.from_descriptor(&descriptor[1..])?;
        let supertype = match element.supertype {
            Some(element_super) if element.is_object_like() && element_super.is_object_like() => {
                match element_super.descriptor() {
                    Some(element_super_desc) => {
                        self.array_type(&format!("[{}", element_super_desc))?
                    }
                    None => self.object,
                }
            }
            _ => self.object,
        };

        Ok(self.intern(kind, supertype))
    }

    /// Type of the object created by the `new` instruction at this offset
    pub fn uninitialized(&'g self, offset: u16) -> VType<'g> {
        self.intern(TypeKind::Uninitialized(offset), self.top)
    }

    /// Get the verification type of a field descriptor
    ///
    /// `boolean`, `byte`, `char`, and `short` are all represented as `int`.
    pub fn from_descriptor(&'g self, descriptor: &str) -> Result<VType<'g>, Error> {
        match DescriptorShape::parse(descriptor).map_err(Error::InvalidDescriptor)? {
            DescriptorShape::Integer => Ok(self.integer),
            DescriptorShape::Float => Ok(self.float),
            DescriptorShape::Long => Ok(self.long),
            DescriptorShape::Double => Ok(self.double),
            DescriptorShape::Object(name) => {
                let name =
                    BinaryName::from_string(name.to_owned()).map_err(Error::InvalidBinaryName)?;
                Ok(self.class_type(&name))
            }
            DescriptorShape::Array(descriptor) => self.array_type(descriptor),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_types<'g>(lattice: &'g TypeLattice<'g>) -> Vec<VType<'g>> {
        let runtime_exception = lattice
            .declare_class(
                BinaryName::from_string(String::from("java/lang/RuntimeException")).unwrap(),
                lattice.throwable(),
            )
            .unwrap();
        let error = lattice
            .declare_class(
                BinaryName::from_string(String::from("java/lang/Error")).unwrap(),
                lattice.throwable(),
            )
            .unwrap();
        vec![
            lattice.top(),
            lattice.integer(),
            lattice.float(),
            lattice.long(),
            lattice.double(),
            lattice.null(),
            lattice.uninitialized_this(),
            lattice.uninitialized(3),
            lattice.uninitialized(9),
            lattice.object(),
            lattice.throwable(),
            lattice.string(),
            runtime_exception,
            error,
            lattice.array_type("[I").unwrap(),
            lattice.array_type("[[I").unwrap(),
            lattice.array_type("[Ljava/lang/String;").unwrap(),
            lattice.array_type("[Ljava/lang/Error;").unwrap(),
            lattice.array_type("[[Ljava/lang/String;").unwrap(),
        ]
    }

    #[test]
    fn interning() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);

        let string1 = lattice.from_descriptor("Ljava/lang/String;").unwrap();
        assert!(std::ptr::eq(string1, lattice.string()));

        let foo1 = lattice.class_type(&BinaryName::from_string(String::from("Foo")).unwrap());
        let foo2 = lattice.from_descriptor("LFoo;").unwrap();
        assert!(std::ptr::eq(foo1, foo2));
        assert_eq!(foo1.supertype(), Some(lattice.object()));

        assert!(std::ptr::eq(lattice.uninitialized(4), lattice.uninitialized(4)));
        assert_ne!(lattice.uninitialized(4), lattice.uninitialized(5));

        assert!(std::ptr::eq(lattice.from_descriptor("Z").unwrap(), lattice.integer()));
        assert!(lattice.from_descriptor("V").is_err());
        assert!(lattice.array_type("I").is_err());
    }

    #[test]
    fn conflicting_supertypes() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let name = BinaryName::from_string(String::from("Foo")).unwrap();

        lattice.class_type(&name);
        assert!(matches!(
            lattice.declare_class(name.clone(), lattice.throwable()),
            Err(Error::ConflictingSupertype { .. })
        ));
        assert!(lattice.declare_class(name, lattice.object()).is_ok());
        assert!(lattice
            .declare_class(BinaryName::OBJECT, lattice.object())
            .is_err());
    }

    #[test]
    fn array_supertypes() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);

        let int_array = lattice.array_type("[I").unwrap();
        assert_eq!(int_array.supertype(), Some(lattice.object()));

        let strings = lattice.array_type("[[Ljava/lang/String;").unwrap();
        let chain: Vec<String> = std::iter::successors(Some(strings), |t| t.supertype())
            .map(|t| t.to_string())
            .collect();
        assert_eq!(
            chain,
            vec![
                "[[Ljava/lang/String;",
                "[[Ljava/lang/Object;",
                "[Ljava/lang/Object;",
                "java/lang/Object",
                "top",
            ]
        );

        let int_matrix = lattice.array_type("[[I").unwrap();
        assert_eq!(
            int_matrix.supertype().map(|t| t.to_string()),
            Some(String::from("[Ljava/lang/Object;"))
        );
    }

    #[test]
    fn assignability() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let strings = lattice.array_type("[Ljava/lang/String;").unwrap();
        let objects = lattice.array_type("[Ljava/lang/Object;").unwrap();

        assert!(lattice.string().is_assignable(lattice.object()));
        assert!(!lattice.object().is_assignable(lattice.string()));
        assert!(strings.is_assignable(objects));
        assert!(strings.is_assignable(lattice.object()));
        assert!(lattice.null().is_assignable(strings));
        assert!(lattice.null().is_assignable(lattice.string()));
        assert!(!lattice.string().is_assignable(lattice.null()));
        assert!(!lattice.null().is_assignable(lattice.long()));
        assert!(!lattice.integer().is_assignable(lattice.float()));
        assert!(lattice.long().is_assignable(lattice.top()));
    }

    #[test]
    fn merges() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let nca = VerificationType::nearest_common_ancestor;

        assert_eq!(nca(lattice.integer(), lattice.long()), lattice.top());
        assert_eq!(nca(lattice.null(), lattice.string()), lattice.string());
        assert_eq!(nca(lattice.throwable(), lattice.null()), lattice.throwable());
        assert_eq!(nca(lattice.string(), lattice.throwable()), lattice.object());
        assert_eq!(nca(lattice.null(), lattice.integer()), lattice.top());
        assert_eq!(
            nca(lattice.uninitialized(1), lattice.uninitialized(2)),
            lattice.top()
        );

        let strings = lattice.array_type("[Ljava/lang/String;").unwrap();
        let ints = lattice.array_type("[I").unwrap();
        let classes = lattice.array_type("[Ljava/lang/Class;").unwrap();
        assert_eq!(nca(strings, ints), lattice.object());
        assert_eq!(
            nca(strings, classes),
            lattice.array_type("[Ljava/lang/Object;").unwrap()
        );
    }

    #[test]
    fn merge_is_sound_and_tight() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let types = sample_types(&lattice);

        for x in &types {
            for y in &types {
                let ancestor = VerificationType::nearest_common_ancestor(x, y);
                assert!(x.is_assignable(ancestor), "{} !<: {}", x, ancestor);
                assert!(y.is_assignable(ancestor), "{} !<: {}", y, ancestor);
                assert_eq!(ancestor, VerificationType::nearest_common_ancestor(y, x));

                // Nothing more specific along either chain is a common ancestor
                for (start, other) in [(x, y), (y, x)] {
                    let chain = std::iter::successors(Some(*start), |t| t.supertype());
                    for candidate in chain.filter(|t| *t != ancestor && t.is_assignable(ancestor)) {
                        assert!(
                            !other.is_assignable(candidate),
                            "{} is a more specific ancestor of {} and {}",
                            candidate,
                            x,
                            y
                        );
                    }
                }
            }
        }
    }
}
