//! Typed attributes attached to functions, parameters, and ops.

use crate::types::IrType;

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    /// Integer with an explicit IR type, e.g. `1 : i32`.
    Int { value: i64, ty: IrType },
    /// Float with an explicit IR type.
    Float { value: f64, ty: IrType },
    /// String literal.
    Str(String),
    /// Symbol reference, e.g. `@other_fn`.
    Symbol(String),
    /// Array of attributes.
    Array(Vec<Attribute>),
}

impl Attribute {
    /// Integer value, if this is an integer attribute.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// String value, if this is a string attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Symbol name, if this is a symbol reference.
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Attribute::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

/// An ordered name → attribute map. Attribute counts are small, so this is
/// a plain vector with linear lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrMap {
    entries: Vec<(String, Attribute)>,
}

impl AttrMap {
    /// Create an empty map.
    pub fn new() -> Self {
        AttrMap::default()
    }

    /// Insert or replace an attribute.
    pub fn set(&mut self, name: impl Into<String>, attr: Attribute) {
        let name = name.into();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = attr;
        } else {
            self.entries.push((name, attr));
        }
    }

    /// Look up an attribute by name.
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    /// Whether a string attribute equals the given value. Used for the
    /// `specialize.shape`/`specialize.value` `"required"` markers.
    pub fn str_is(&self, name: &str, value: &str) -> bool {
        self.get(name).and_then(Attribute::as_str) == Some(value)
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), a))
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
