/// How a loaded `None` constant appears in the output tree
///
/// The compiled form does not record whether the source spelled a dedicated
/// None literal or a plain name lookup that the compiler folded. Both
/// readings are available; callers pick the one their consumer expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoneLiteral {
    /// Keep `Const(None)` exactly as loaded
    #[default]
    Constant,
    /// Rewrite to `Name("None")`, matching what a source parser produces
    /// for this bytecode generation
    Name,
}

/// Decompiler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompileOptions {
    pub none_literal: NoneLiteral,
    /// Limit on generator expressions nested inside each other
    pub max_nesting_depth: usize,
    /// Turn constant tuples into `Tuple` nodes of constants
    pub expand_constant_tuples: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        DecompileOptions {
            none_literal: NoneLiteral::Constant,
            max_nesting_depth: 16,
            expand_constant_tuples: true,
        }
    }
}

impl DecompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_none_literal(mut self, none_literal: NoneLiteral) -> Self {
        self.none_literal = none_literal;
        self
    }

    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub fn with_expand_constant_tuples(mut self, expand: bool) -> Self {
        self.expand_constant_tuples = expand;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = DecompileOptions::default();
        assert_eq!(options.none_literal, NoneLiteral::Constant);
        assert_eq!(options.max_nesting_depth, 16);
        assert!(options.expand_constant_tuples);
    }

    #[test]
    fn test_builders() {
        let options = DecompileOptions::new()
            .with_none_literal(NoneLiteral::Name)
            .with_max_nesting_depth(2)
            .with_expand_constant_tuples(false);
        assert_eq!(options.none_literal, NoneLiteral::Name);
        assert_eq!(options.max_nesting_depth, 2);
        assert!(!options.expand_constant_tuples);
    }
}
