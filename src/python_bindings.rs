//! Python bindings for the genexpr decompiler
//!
//! Code objects are read by duck typing through their `co_*` attributes,
//! so objects loaded with a foreign `marshal` work as long as they expose
//! the same fields.

use pyo3::exceptions::{PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyBytes, PyFloat, PyInt, PyString, PyTuple};
use std::sync::{Arc, LazyLock};

use crate::artifact::{ArtifactError, CodeArtifact};
use crate::cache::{ArtifactKey, DecompileCache};
use crate::constant_pool::{Constant, ConstantPool};
use crate::error::DecompileError;
use crate::machine::Decompiled;
use crate::{decoder, parser, render};

static CACHE: LazyLock<DecompileCache<ArtifactKey>> = LazyLock::new(DecompileCache::new);

fn decompile_err(error: DecompileError) -> PyErr {
    PyValueError::new_err(format!("Decompilation error: {}", error))
}

fn artifact_err(error: ArtifactError) -> PyErr {
    PyRuntimeError::new_err(format!("Artifact error: {}", error))
}

fn constant_from_py(obj: &Bound<'_, PyAny>) -> PyResult<Constant> {
    if obj.is_none() {
        Ok(Constant::None)
    } else if obj.is_instance_of::<PyBool>() {
        Ok(Constant::Bool(obj.extract()?))
    } else if obj.is_instance_of::<PyInt>() {
        Ok(Constant::Int(obj.extract()?))
    } else if obj.is_instance_of::<PyFloat>() {
        Ok(Constant::Float(obj.extract()?))
    } else if obj.is_instance_of::<PyString>() {
        Ok(Constant::Str(obj.extract()?))
    } else if obj.is_instance_of::<PyBytes>() {
        let raw: Vec<u8> = obj.extract()?;
        Ok(Constant::Str(String::from_utf8_lossy(&raw).into_owned()))
    } else if obj.is_instance_of::<PyTuple>() {
        let items = obj
            .try_iter()?
            .map(|item| constant_from_py(&item?))
            .collect::<PyResult<Vec<_>>>()?;
        Ok(Constant::Tuple(items))
    } else if obj.hasattr("co_code")? {
        Ok(Constant::Code(Box::new(artifact_from_py(obj)?)))
    } else {
        Err(PyTypeError::new_err(format!(
            "Unsupported constant of type {}",
            obj.get_type().name()?
        )))
    }
}

fn artifact_from_py(code: &Bound<'_, PyAny>) -> PyResult<CodeArtifact> {
    let constants = code
        .getattr("co_consts")?
        .try_iter()?
        .map(|item| constant_from_py(&item?))
        .collect::<PyResult<Vec<_>>>()?;

    Ok(CodeArtifact {
        name: code.getattr("co_name")?.extract()?,
        code: code.getattr("co_code")?.extract()?,
        constants: ConstantPool::from_vec(constants),
        names: code.getattr("co_names")?.extract()?,
        varnames: code.getattr("co_varnames")?.extract()?,
        cell_vars: code.getattr("co_cellvars")?.extract()?,
        free_vars: code.getattr("co_freevars")?.extract()?,
        arg_count: code.getattr("co_argcount")?.extract()?,
        flags: code.getattr("co_flags")?.extract()?,
    })
}

/// A decompiled expression
///
/// Results are cached per artifact and shared between callers.
#[pyclass(name = "Decompiled", frozen)]
struct PyDecompiled {
    inner: Arc<Decompiled>,
}

#[pymethods]
impl PyDecompiled {
    /// Compiler-AST style structure, e.g. `GenExprInner(Name('a'), [...])`
    #[getter]
    fn ast(&self) -> String {
        render(&self.inner.root)
    }

    /// Source-like rendering; the outer iterable prints as `.0`
    #[getter]
    fn source(&self) -> String {
        self.inner.root.to_string()
    }

    /// Names read but never bound, sorted
    #[getter]
    fn external_names(&self) -> Vec<String> {
        self.inner.external_names.iter().cloned().collect()
    }

    #[getter]
    fn is_genexpr(&self) -> bool {
        self.inner.genexpr().is_some()
    }

    fn __repr__(&self) -> String {
        format!("<Decompiled {}>", self.inner.root)
    }
}

/// Decompile a code object
///
/// Args:
///     code: object exposing co_code, co_consts, co_names, co_varnames,
///         co_cellvars, co_freevars, co_argcount, co_flags and co_name
///
/// Raises:
///     TypeError: If a constant cannot be represented
///     ValueError: If the bytecode cannot be decompiled
///
/// Example:
///     >>> result = decompile(code)
///     >>> result.source
///     '(p.name for p in .0 if p.age > 20)'
#[pyfunction]
fn decompile(code: &Bound<'_, PyAny>) -> PyResult<PyDecompiled> {
    let artifact = artifact_from_py(code)?;
    let key = ArtifactKey::of(&artifact).map_err(artifact_err)?;
    CACHE
        .get_or_decompile(key, &artifact)
        .map(|inner| PyDecompiled { inner })
        .map_err(decompile_err)
}

/// Decompile a serialized artifact (see `compile`)
#[pyfunction]
fn decompile_bytes(data: &[u8]) -> PyResult<PyDecompiled> {
    let artifact = CodeArtifact::from_proto_bytes(data).map_err(artifact_err)?;
    CACHE
        .get_or_decompile(ArtifactKey::from_encoded(data), &artifact)
        .map(|inner| PyDecompiled { inner })
        .map_err(decompile_err)
}

/// Compile an expression with the reference compiler
///
/// Returns:
///     bytes: Serialized artifact, accepted by `decompile_bytes`
///
/// Raises:
///     ValueError: If the expression does not parse
#[pyfunction]
fn compile<'py>(py: Python<'py>, source: &str) -> PyResult<Bound<'py, PyBytes>> {
    let artifact = parser::compile(source)
        .map_err(|e| PyValueError::new_err(format!("Compilation error: {}", e)))?;
    artifact
        .to_proto_bytes()
        .map(|bytes| PyBytes::new(py, &bytes))
        .map_err(artifact_err)
}

/// Disassembly listing of a serialized artifact
#[pyfunction]
fn disassemble(data: &[u8]) -> PyResult<String> {
    let artifact = CodeArtifact::from_proto_bytes(data).map_err(artifact_err)?;
    decoder::disassemble(&artifact).map_err(decompile_err)
}

#[pyfunction]
fn cache_size() -> usize {
    CACHE.len()
}

#[pyfunction]
fn clear_cache() {
    CACHE.clear();
}

/// Python module definition
#[pymodule]
fn _decompiler_rust(m: &Bound<'_, pyo3::types::PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(decompile, m)?)?;
    m.add_function(wrap_pyfunction!(decompile_bytes, m)?)?;
    m.add_function(wrap_pyfunction!(compile, m)?)?;
    m.add_function(wrap_pyfunction!(disassemble, m)?)?;
    m.add_function(wrap_pyfunction!(cache_size, m)?)?;
    m.add_function(wrap_pyfunction!(clear_cache, m)?)?;

    m.add_class::<PyDecompiled>()?;

    m.add("BYTECODE_FORMAT", crate::BYTECODE_FORMAT)?;
    m.add("ARTIFACT_VERSION", crate::ARTIFACT_VERSION)?;

    Ok(())
}
