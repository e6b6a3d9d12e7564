use crate::artifact::CodeArtifact;
use std::fmt;

/// A constant in the constant pool
///
/// Mirrors what `LOAD_CONST` can reference in the target format: literals,
/// constant tuples folded by the compiler, and the code objects of nested
/// generator expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// None literal
    None,

    /// Boolean literal
    Bool(bool),

    /// Integer literal
    Int(i64),

    /// Float literal
    Float(f64),

    /// String literal
    Str(String),

    /// Constant tuple, e.g. `(1, 2, 'x')`
    Tuple(Vec<Constant>),

    /// Code of a nested generator expression or lambda
    Code(Box<CodeArtifact>),
}

impl Constant {
    /// Get the string value if this is a string literal
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the nested code if this is a code constant
    pub fn as_code(&self) -> Option<&CodeArtifact> {
        match self {
            Constant::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Constant::None)
    }

    pub fn is_code(&self) -> bool {
        matches!(self, Constant::Code(_))
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => write!(f, "None"),
            Constant::Bool(true) => write!(f, "True"),
            Constant::Bool(false) => write!(f, "False"),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(x) => write!(f, "{:?}", x),
            Constant::Str(s) => f.write_str(&quote_str(s)),
            Constant::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Constant::Code(code) => write!(f, "<code {}>", code.name),
        }
    }
}

/// Single-quoted literal with backslash escapes, as the host language prints it
pub fn quote_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Constant pool of a single code artifact
///
/// Constants are accessed by index from `LOAD_CONST` operands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    constants: Vec<Constant>,
}

impl ConstantPool {
    /// Create a new empty constant pool
    pub fn new() -> Self {
        ConstantPool {
            constants: Vec::new(),
        }
    }

    /// Create a constant pool from a vector of constants
    pub fn from_vec(constants: Vec<Constant>) -> Self {
        ConstantPool { constants }
    }

    /// Add a constant to the pool and return its index
    pub fn add(&mut self, constant: Constant) -> u32 {
        let index = self.constants.len() as u32;
        self.constants.push(constant);
        index
    }

    /// Get a constant by index
    pub fn get(&self, index: u32) -> Result<&Constant, String> {
        self.constants.get(index as usize).ok_or_else(|| {
            format!(
                "constant index {} out of bounds (pool has {})",
                index,
                self.constants.len()
            )
        })
    }

    /// Index of an equal constant already in the pool
    pub fn position(&self, constant: &Constant) -> Option<u32> {
        self.constants
            .iter()
            .position(|c| same_constant(c, constant))
            .map(|i| i as u32)
    }

    /// Get the number of constants in the pool
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.constants.iter()
    }
}

/// Equality used for constant deduplication
///
/// Stricter than `PartialEq`: `1`, `1.0` and `True` stay distinct, and floats
/// compare by bit pattern so `0.0` and `-0.0` keep separate slots.
fn same_constant(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::None, Constant::None) => true,
        (Constant::Bool(x), Constant::Bool(y)) => x == y,
        (Constant::Int(x), Constant::Int(y)) => x == y,
        (Constant::Float(x), Constant::Float(y)) => x.to_bits() == y.to_bits(),
        (Constant::Str(x), Constant::Str(y)) => x == y,
        (Constant::Tuple(xs), Constant::Tuple(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_constant(x, y))
        }
        // Nested code objects are never shared between sites
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_pool_basic() {
        let mut pool = ConstantPool::new();

        let idx1 = pool.add(Constant::Int(42));
        let idx2 = pool.add(Constant::Str("hello".to_string()));
        let idx3 = pool.add(Constant::None);

        assert_eq!(idx1, 0);
        assert_eq!(idx2, 1);
        assert_eq!(idx3, 2);
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.get(idx1).unwrap(), &Constant::Int(42));
        assert_eq!(pool.get(idx2).unwrap().as_str(), Some("hello"));
        assert!(pool.get(idx3).unwrap().is_none());
        assert!(pool.get(3).is_err());
    }

    #[test]
    fn test_position_keeps_kinds_apart() {
        let pool = ConstantPool::from_vec(vec![
            Constant::Int(1),
            Constant::Bool(true),
            Constant::Float(-0.0),
        ]);

        assert_eq!(pool.position(&Constant::Int(1)), Some(0));
        assert_eq!(pool.position(&Constant::Bool(true)), Some(1));
        assert_eq!(pool.position(&Constant::Float(1.0)), None);
        assert_eq!(pool.position(&Constant::Float(0.0)), None);
        assert_eq!(pool.position(&Constant::Float(-0.0)), Some(2));
    }

    #[test]
    fn test_constant_display() {
        assert_eq!(Constant::None.to_string(), "None");
        assert_eq!(Constant::Bool(false).to_string(), "False");
        assert_eq!(Constant::Float(1.0).to_string(), "1.0");
        assert_eq!(Constant::Str("x".to_string()).to_string(), "'x'");
        assert_eq!(quote_str("it's\n"), "'it\\'s\\n'");
        assert_eq!(
            Constant::Tuple(vec![Constant::Int(1)]).to_string(),
            "(1,)"
        );
        assert_eq!(
            Constant::Tuple(vec![Constant::Int(1), Constant::Int(2)]).to_string(),
            "(1, 2)"
        );
    }
}
