//! # Media capabilities
//!
//! Minimal model of the capabilities a media pipeline negotiates between its elements. A [`Caps`] value is either
//! "any" or a list of [`Structure`]s, each being a media type name with a set of typed fields.
//!
//! Only intersection is required by the negotiation engine, fields with a list value intersect with every
//! element of the list.

use std::fmt;

/// Value of a single field inside a [`Structure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapsValue {
    Int(i64),
    Str(String),
    /// Any of the contained values
    List(Vec<CapsValue>),
}

impl CapsValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CapsValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CapsValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn intersect(&self, other: &CapsValue) -> Option<CapsValue> {
        match (self, other) {
            (CapsValue::Int(a), CapsValue::Int(b)) if a == b => Some(CapsValue::Int(*a)),
            (CapsValue::Str(a), CapsValue::Str(b)) if a == b => Some(CapsValue::Str(a.clone())),
            (CapsValue::List(list), value) | (value, CapsValue::List(list)) => {
                let mut common: Vec<CapsValue> = Vec::new();

                for v in list.iter().filter_map(|entry| entry.intersect(value)) {
                    if !common.contains(&v) {
                        common.push(v);
                    }
                }

                match common.len() {
                    0 => None,
                    1 => common.pop(),
                    _ => Some(CapsValue::List(common)),
                }
            }
            _ => None,
        }
    }
}

impl From<&str> for CapsValue {
    fn from(value: &str) -> Self {
        CapsValue::Str(value.to_owned())
    }
}

impl From<String> for CapsValue {
    fn from(value: String) -> Self {
        CapsValue::Str(value)
    }
}

impl From<i64> for CapsValue {
    fn from(value: i64) -> Self {
        CapsValue::Int(value)
    }
}

impl From<u32> for CapsValue {
    fn from(value: u32) -> Self {
        CapsValue::Int(i64::from(value))
    }
}

impl fmt::Display for CapsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapsValue::Int(i) => write!(f, "(int){i}"),
            CapsValue::Str(s) => write!(f, "(string){s}"),
            CapsValue::List(list) => {
                write!(f, "{{ ")?;
                for (i, v) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, " }}")
            }
        }
    }
}

/// A named media type with typed fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structure {
    name: String,
    fields: Vec<(String, CapsValue)>,
}

impl Structure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<CapsValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &CapsValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn get(&self, name: &str) -> Option<&CapsValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(CapsValue::as_str)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(CapsValue::as_int)
    }

    /// Set or replace a field
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<CapsValue>) {
        let name = name.into();
        let value = value.into();

        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(field, _)| field != name);
    }

    /// Intersect two structures, fields present in only one of them are kept as is
    pub fn intersect(&self, other: &Structure) -> Option<Structure> {
        if self.name != other.name {
            return None;
        }

        let mut result = Structure::new(self.name.clone());

        for (name, value) in &self.fields {
            match other.get(name) {
                Some(other_value) => result.fields.push((name.clone(), value.intersect(other_value)?)),
                None => result.fields.push((name.clone(), value.clone())),
            }
        }

        for (name, value) in &other.fields {
            if self.get(name).is_none() {
                result.fields.push((name.clone(), value.clone()));
            }
        }

        Some(result)
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;

        for (name, value) in &self.fields {
            write!(f, ", {name}={value}")?;
        }

        Ok(())
    }
}

/// Set of media capabilities
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Caps {
    any: bool,
    structures: Vec<Structure>,
}

impl Caps {
    /// Caps which are compatible with everything
    pub fn new_any() -> Self {
        Self {
            any: true,
            structures: Vec::new(),
        }
    }

    /// Caps which are compatible with nothing
    pub fn new_empty() -> Self {
        Self::default()
    }

    pub fn new_simple(name: impl Into<String>) -> Self {
        Self::from(Structure::new(name))
    }

    pub fn with_structure(mut self, structure: Structure) -> Self {
        self.append(structure);
        self
    }

    pub fn append(&mut self, structure: Structure) {
        if !self.any && !self.structures.contains(&structure) {
            self.structures.push(structure);
        }
    }

    pub fn is_any(&self) -> bool {
        self.any
    }

    pub fn is_empty(&self) -> bool {
        !self.any && self.structures.is_empty()
    }

    pub fn structures(&self) -> &[Structure] {
        &self.structures
    }

    pub fn structures_mut(&mut self) -> &mut [Structure] {
        &mut self.structures
    }

    pub fn intersect(&self, other: &Caps) -> Caps {
        if self.any {
            return other.clone();
        }

        if other.any {
            return self.clone();
        }

        let mut result = Caps::new_empty();

        for a in &self.structures {
            for b in &other.structures {
                if let Some(structure) = a.intersect(b) {
                    result.append(structure);
                }
            }
        }

        result
    }

    pub fn can_intersect(&self, other: &Caps) -> bool {
        if self.any || other.any {
            return !self.intersect(other).is_empty();
        }

        self.structures
            .iter()
            .any(|a| other.structures.iter().any(|b| a.intersect(b).is_some()))
    }
}

impl From<Structure> for Caps {
    fn from(structure: Structure) -> Self {
        Self {
            any: false,
            structures: vec![structure],
        }
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return write!(f, "ANY");
        }

        if self.structures.is_empty() {
            return write!(f, "EMPTY");
        }

        for (i, structure) in self.structures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{structure}")?;
        }

        Ok(())
    }
}
