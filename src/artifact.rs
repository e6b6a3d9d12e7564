use crate::constant_pool::{Constant, ConstantPool};
use thiserror::Error;

/// Local slot holding the outermost iterable of a generator expression
pub const OUTER_ITERABLE_SLOT: &str = ".0";

/// `co_flags` bit: the slot after the positional parameters takes `*args`
pub const CO_VARARGS: u32 = 0x04;
/// `co_flags` bit: the next slot takes `**kwargs`
pub const CO_VARKEYWORDS: u32 = 0x08;

/// Protobuf messages for shipping artifacts between processes
///
/// Declared directly with the prost derives; the nested-code constant makes
/// the schema recursive through `Vec`, so no boxing is needed.
pub mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CodeArtifact {
        #[prost(uint32, tag = "1")]
        pub version: u32,
        #[prost(string, tag = "2")]
        pub name: String,
        #[prost(bytes = "vec", tag = "3")]
        pub code: Vec<u8>,
        #[prost(message, repeated, tag = "4")]
        pub constants: Vec<Constant>,
        #[prost(string, repeated, tag = "5")]
        pub names: Vec<String>,
        #[prost(string, repeated, tag = "6")]
        pub varnames: Vec<String>,
        #[prost(string, repeated, tag = "7")]
        pub cell_vars: Vec<String>,
        #[prost(string, repeated, tag = "8")]
        pub free_vars: Vec<String>,
        #[prost(uint32, tag = "9")]
        pub arg_count: u32,
        #[prost(uint32, tag = "10")]
        pub flags: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Constant {
        #[prost(oneof = "constant::Value", tags = "1, 2, 3, 4, 5, 6, 7")]
        pub value: Option<constant::Value>,
    }

    pub mod constant {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Value {
            #[prost(message, tag = "1")]
            NoneValue(super::NoneValue),
            #[prost(bool, tag = "2")]
            BoolValue(bool),
            #[prost(int64, tag = "3")]
            IntValue(i64),
            #[prost(double, tag = "4")]
            FloatValue(f64),
            #[prost(string, tag = "5")]
            StrValue(String),
            #[prost(message, tag = "6")]
            TupleValue(super::ConstantTuple),
            #[prost(message, tag = "7")]
            CodeValue(super::CodeArtifact),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct NoneValue {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ConstantTuple {
        #[prost(message, repeated, tag = "1")]
        pub items: Vec<Constant>,
    }
}

/// Errors raised while (de)serializing artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to decode artifact: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to encode artifact: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("constant #{index} of {code} has no value")]
    EmptyConstant { code: String, index: usize },

    #[error("unsupported artifact version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// A compiled code object: instruction bytes plus the tables its operands
/// index into
///
/// Treated as immutable input by the decompiler. The deref index space used
/// by `LOAD_DEREF`/`STORE_DEREF`/`LOAD_CLOSURE` is `cell_vars` followed by
/// `free_vars`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodeArtifact {
    /// Display name, e.g. `<genexpr>` or `<lambda>`
    pub name: String,

    /// Raw instruction bytes
    pub code: Vec<u8>,

    /// Constants referenced by `LOAD_CONST`
    pub constants: ConstantPool,

    /// Global/attribute names
    pub names: Vec<String>,

    /// Local variable names; slot 0 of generator code is `.0`
    pub varnames: Vec<String>,

    /// Locals captured by nested code
    pub cell_vars: Vec<String>,

    /// Variables captured from the enclosing scope
    pub free_vars: Vec<String>,

    /// Positional parameters, the leading slots of `varnames`
    pub arg_count: u32,

    /// `co_flags`; only [`CO_VARARGS`] and [`CO_VARKEYWORDS`] are read
    pub flags: u32,
}

/// Parameter list of function code
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Parameters {
    pub args: Vec<String>,
    pub varargs: Option<String>,
    pub kwargs: Option<String>,
}

impl CodeArtifact {
    pub fn new(name: impl Into<String>, code: Vec<u8>) -> Self {
        CodeArtifact {
            name: name.into(),
            code,
            ..Default::default()
        }
    }

    /// Resolve an index into the combined cell/free table
    pub fn deref_name(&self, index: usize) -> Option<&str> {
        if index < self.cell_vars.len() {
            self.cell_vars.get(index).map(String::as_str)
        } else {
            self.free_vars
                .get(index - self.cell_vars.len())
                .map(String::as_str)
        }
    }

    /// Size of the combined cell/free table
    pub fn deref_count(&self) -> usize {
        self.cell_vars.len() + self.free_vars.len()
    }

    /// Generator code takes the outer iterable as its only argument
    pub fn is_generator(&self) -> bool {
        self.varnames.first().map(String::as_str) == Some(OUTER_ITERABLE_SLOT)
    }

    /// Split the leading `varnames` into the parameter list
    ///
    /// `None` when `varnames` has fewer slots than the parameters need.
    pub fn parameters(&self) -> Option<Parameters> {
        let mut slots = self.varnames.iter().cloned();
        let mut args = Vec::new();
        for _ in 0..self.arg_count {
            args.push(slots.next()?);
        }
        let varargs = match self.flags & CO_VARARGS {
            0 => None,
            _ => Some(slots.next()?),
        };
        let kwargs = match self.flags & CO_VARKEYWORDS {
            0 => None,
            _ => Some(slots.next()?),
        };
        Some(Parameters {
            args,
            varargs,
            kwargs,
        })
    }

    /// Deserialize an artifact from protobuf bytes
    pub fn from_proto_bytes(bytes: &[u8]) -> Result<Self, ArtifactError> {
        use prost::Message;

        let proto_artifact = proto::CodeArtifact::decode(bytes)?;
        Self::from_proto(proto_artifact)
    }

    /// Convert from protobuf CodeArtifact message
    pub fn from_proto(proto: proto::CodeArtifact) -> Result<Self, ArtifactError> {
        if proto.version != crate::ARTIFACT_VERSION {
            return Err(ArtifactError::UnsupportedVersion {
                found: proto.version,
                expected: crate::ARTIFACT_VERSION,
            });
        }

        let mut constants = ConstantPool::new();
        for (index, proto_const) in proto.constants.into_iter().enumerate() {
            constants.add(convert_constant(proto_const, &proto.name, index)?);
        }

        Ok(CodeArtifact {
            name: proto.name,
            code: proto.code,
            constants,
            names: proto.names,
            varnames: proto.varnames,
            cell_vars: proto.cell_vars,
            free_vars: proto.free_vars,
            arg_count: proto.arg_count,
            flags: proto.flags,
        })
    }

    /// Serialize this artifact to protobuf bytes
    pub fn to_proto_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        use prost::Message;

        let proto = self.to_proto();
        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto.encode(&mut buf)?;
        Ok(buf)
    }

    /// Convert to protobuf CodeArtifact message
    pub fn to_proto(&self) -> proto::CodeArtifact {
        proto::CodeArtifact {
            version: crate::ARTIFACT_VERSION,
            name: self.name.clone(),
            code: self.code.clone(),
            constants: self.constants.iter().map(convert_constant_to_proto).collect(),
            names: self.names.clone(),
            varnames: self.varnames.clone(),
            cell_vars: self.cell_vars.clone(),
            free_vars: self.free_vars.clone(),
            arg_count: self.arg_count,
            flags: self.flags,
        }
    }
}

/// Convert protobuf Constant to our Constant
fn convert_constant(
    proto_const: proto::Constant,
    owner: &str,
    index: usize,
) -> Result<Constant, ArtifactError> {
    use proto::constant::Value as PV;

    let value = proto_const.value.ok_or_else(|| ArtifactError::EmptyConstant {
        code: owner.to_string(),
        index,
    })?;

    Ok(match value {
        PV::NoneValue(_) => Constant::None,
        PV::BoolValue(b) => Constant::Bool(b),
        PV::IntValue(i) => Constant::Int(i),
        PV::FloatValue(f) => Constant::Float(f),
        PV::StrValue(s) => Constant::Str(s),
        PV::TupleValue(tuple) => Constant::Tuple(
            tuple
                .items
                .into_iter()
                .enumerate()
                .map(|(i, item)| convert_constant(item, owner, i))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        PV::CodeValue(code) => Constant::Code(Box::new(CodeArtifact::from_proto(code)?)),
    })
}

/// Convert our Constant to protobuf Constant
fn convert_constant_to_proto(constant: &Constant) -> proto::Constant {
    use proto::constant::Value as PV;

    let value = match constant {
        Constant::None => PV::NoneValue(proto::NoneValue {}),
        Constant::Bool(b) => PV::BoolValue(*b),
        Constant::Int(i) => PV::IntValue(*i),
        Constant::Float(f) => PV::FloatValue(*f),
        Constant::Str(s) => PV::StrValue(s.clone()),
        Constant::Tuple(items) => PV::TupleValue(proto::ConstantTuple {
            items: items.iter().map(convert_constant_to_proto).collect(),
        }),
        Constant::Code(code) => PV::CodeValue(code.to_proto()),
    };

    proto::Constant { value: Some(value) }
}
