use std::fmt;

/// Identity of a method in the host runtime: declaring class, method name and
/// method descriptor (the host runtime's own grammar for parameter/return
/// types -- opaque to this crate, just compared and displayed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodFqName {
    pub class: String,
    pub method: String,
    pub descriptor: String,
}

impl MethodFqName {
    pub fn new(
        class: impl Into<String>,
        method: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        MethodFqName {
            class: class.into(),
            method: method.into(),
            descriptor: descriptor.into(),
        }
    }
}

impl fmt::Display for MethodFqName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}{}", self.class, self.method, self.descriptor)
    }
}
