use crate::{AbstractValue, DType, Literal, Shape, ShapeError};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};
use std::hash::{Hash, Hasher};

pub type AbstractEvalFn = fn(&[AbstractValue], &Params) -> Result<Vec<AbstractValue>, ShapeError>;

/// A named, side-effect-free operation.
///
/// Primitives are declared as `static` items and referenced by `&'static`
/// pointer; two primitives are the same primitive iff their names match.
pub struct Primitive {
    name: &'static str,
    multiple_results: bool,
    abstract_eval: AbstractEvalFn,
}

impl Primitive {
    #[must_use]
    pub const fn new(name: &'static str, abstract_eval: AbstractEvalFn) -> Self {
        Self {
            name,
            multiple_results: false,
            abstract_eval,
        }
    }

    #[must_use]
    pub const fn with_multiple_results(name: &'static str, abstract_eval: AbstractEvalFn) -> Self {
        Self {
            name,
            multiple_results: true,
            abstract_eval,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn multiple_results(&self) -> bool {
        self.multiple_results
    }

    /// Output abstract values for the given inputs. Single-result primitives
    /// always yield exactly one value.
    pub fn abstract_eval(
        &self,
        args: &[AbstractValue],
        params: &Params,
    ) -> Result<Vec<AbstractValue>, ShapeError> {
        let out = (self.abstract_eval)(args, params)?;
        if !self.multiple_results && out.len() != 1 {
            return Err(ShapeError::ResultCount {
                primitive: self.name.to_owned(),
                count: out.len(),
            });
        }
        Ok(out)
    }
}

impl PartialEq for Primitive {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Primitive {}

impl Hash for Primitive {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Primitive")
            .field("name", &self.name)
            .field("multiple_results", &self.multiple_results)
            .finish()
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A static equation parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Param {
    Bool(bool),
    Int(i64),
    Ints(Vec<i64>),
    FloatBits(u64),
    Str(String),
    Strs(Vec<String>),
    DType(DType),
    Shape(Shape),
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Ints(values) => write!(f, "{values:?}"),
            Self::FloatBits(bits) => write!(f, "f64bits:{bits}"),
            Self::Str(value) => write!(f, "{value:?}"),
            Self::Strs(values) => write!(f, "{values:?}"),
            Self::DType(dtype) => write!(f, "{dtype}"),
            Self::Shape(shape) => write!(f, "{shape}"),
        }
    }
}

pub type Params = BTreeMap<String, Param>;

/// Typed accessors over [`Params`].
pub trait ParamLookup {
    fn get_int(&self, key: &str) -> Option<i64>;
    fn get_ints(&self, key: &str) -> Option<&[i64]>;
    fn get_str(&self, key: &str) -> Option<&str>;
    fn get_dtype(&self, key: &str) -> Option<DType>;
    fn get_bool(&self, key: &str) -> Option<bool>;
}

impl ParamLookup for Params {
    fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Param::Int(value)) => Some(*value),
            _ => None,
        }
    }

    fn get_ints(&self, key: &str) -> Option<&[i64]> {
        match self.get(key) {
            Some(Param::Ints(values)) => Some(values),
            _ => None,
        }
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Param::Str(value)) => Some(value),
            _ => None,
        }
    }

    fn get_dtype(&self, key: &str) -> Option<DType> {
        match self.get(key) {
            Some(Param::DType(dtype)) => Some(*dtype),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(Param::Bool(value)) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub u32);

impl VarId {
    /// The zero-size unit variable, implicitly bound in every jaxpr.
    pub const UNIT: VarId = VarId(u32::MAX);
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNIT {
            f.write_str("_")
        } else {
            write!(f, "v{}", self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Atom {
    Var(VarId),
    Lit(Literal),
}

/// A nested program invoked by a call-style equation, together with the outer
/// atoms that supply its constants and free variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSubjaxpr {
    pub jaxpr: Jaxpr,
    pub const_bindings: Vec<Atom>,
    pub freevar_bindings: Vec<Atom>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equation {
    pub primitive: &'static Primitive,
    pub inputs: SmallVec<[Atom; 4]>,
    pub outputs: SmallVec<[VarId; 2]>,
    pub params: Params,
    /// Bodies lowered inline by initial-style rules (e.g. cond branches).
    pub sub_jaxprs: Vec<Jaxpr>,
    /// Body of a call-style equation, lowered as its own sub-computation.
    pub bound_subjaxpr: Option<BoundSubjaxpr>,
}

impl Equation {
    #[must_use]
    pub fn new(
        primitive: &'static Primitive,
        inputs: impl IntoIterator<Item = Atom>,
        outputs: impl IntoIterator<Item = VarId>,
    ) -> Self {
        Self {
            primitive,
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            params: Params::new(),
            sub_jaxprs: Vec::new(),
            bound_subjaxpr: None,
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: &str, value: Param) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    #[must_use]
    pub fn with_sub_jaxprs(mut self, sub_jaxprs: Vec<Jaxpr>) -> Self {
        self.sub_jaxprs = sub_jaxprs;
        self
    }

    #[must_use]
    pub fn with_bound_subjaxpr(mut self, bound: BoundSubjaxpr) -> Self {
        self.bound_subjaxpr = Some(bound);
        self
    }
}

/// A program in SSA form. Fields are open for construction and rewriting;
/// the fingerprint is always derived from their current contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jaxpr {
    pub invars: Vec<VarId>,
    pub constvars: Vec<VarId>,
    pub freevars: Vec<VarId>,
    pub outvars: Vec<VarId>,
    pub equations: Vec<Equation>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JaxprValidationError {
    #[error("duplicate binding in {section} for var {var}")]
    DuplicateBinding { section: &'static str, var: VarId },
    #[error("equation {equation_index} references unbound input var {var}")]
    UnboundInputVar { equation_index: usize, var: VarId },
    #[error("equation {equation_index} output var {var} shadows an existing binding")]
    OutputShadowsBinding { equation_index: usize, var: VarId },
    #[error("outvar {var} does not have a defining binding")]
    UnknownOutvar { var: VarId },
    #[error("equation {equation_index} ({primitive}) has an invalid nested program: {source}")]
    Nested {
        equation_index: usize,
        primitive: &'static str,
        #[source]
        source: Box<JaxprValidationError>,
    },
}

impl Jaxpr {
    #[must_use]
    pub fn new(
        invars: Vec<VarId>,
        constvars: Vec<VarId>,
        outvars: Vec<VarId>,
        equations: Vec<Equation>,
    ) -> Self {
        Self {
            invars,
            constvars,
            freevars: Vec::new(),
            outvars,
            equations,
        }
    }

    #[must_use]
    pub fn with_freevars(mut self, freevars: Vec<VarId>) -> Self {
        self.freevars = freevars;
        self
    }

    /// Structural identity used for cache keys. Two jaxprs with the same
    /// fingerprint lower to the same computation for the same argument shapes.
    #[must_use]
    pub fn canonical_fingerprint(&self) -> String {
        let mut out = String::new();
        write_jaxpr(&mut out, self);
        out
    }

    pub fn validate_well_formed(&self) -> Result<(), JaxprValidationError> {
        let mut bindings = BTreeSet::new();
        bindings.insert(VarId::UNIT);

        for (section, vars) in [
            ("invars", &self.invars),
            ("constvars", &self.constvars),
            ("freevars", &self.freevars),
        ] {
            for var in vars {
                if !bindings.insert(*var) {
                    return Err(JaxprValidationError::DuplicateBinding { section, var: *var });
                }
            }
        }

        for (equation_index, eqn) in self.equations.iter().enumerate() {
            let bound_atoms = eqn.bound_subjaxpr.iter().flat_map(|bound| {
                bound
                    .const_bindings
                    .iter()
                    .chain(bound.freevar_bindings.iter())
            });
            for atom in eqn.inputs.iter().chain(bound_atoms) {
                if let Atom::Var(var) = atom
                    && !bindings.contains(var)
                {
                    return Err(JaxprValidationError::UnboundInputVar {
                        equation_index,
                        var: *var,
                    });
                }
            }

            let nested = eqn
                .sub_jaxprs
                .iter()
                .chain(eqn.bound_subjaxpr.iter().map(|bound| &bound.jaxpr));
            for sub in nested {
                sub.validate_well_formed()
                    .map_err(|source| JaxprValidationError::Nested {
                        equation_index,
                        primitive: eqn.primitive.name(),
                        source: Box::new(source),
                    })?;
            }

            for out_var in &eqn.outputs {
                if !bindings.insert(*out_var) {
                    return Err(JaxprValidationError::OutputShadowsBinding {
                        equation_index,
                        var: *out_var,
                    });
                }
            }
        }

        for outvar in &self.outvars {
            if !bindings.contains(outvar) {
                return Err(JaxprValidationError::UnknownOutvar { var: *outvar });
            }
        }

        Ok(())
    }

    /// The primitive whose equation defines `var`, if any.
    #[must_use]
    pub fn producer_of(&self, var: VarId) -> Option<&'static Primitive> {
        self.equations
            .iter()
            .rev()
            .find(|eqn| eqn.outputs.contains(&var))
            .map(|eqn| eqn.primitive)
    }
}

fn write_jaxpr(out: &mut String, jaxpr: &Jaxpr) {
    write_var_list(out, "in", &jaxpr.invars);
    write_var_list(out, "const", &jaxpr.constvars);
    write_var_list(out, "free", &jaxpr.freevars);
    write_var_list(out, "out", &jaxpr.outvars);

    for eqn in &jaxpr.equations {
        let _ = write!(out, "eqn:{}(", eqn.primitive.name());
        for atom in &eqn.inputs {
            write_atom(out, atom);
            out.push(',');
        }
        out.push_str(")->");
        for outvar in &eqn.outputs {
            let _ = write!(out, "{outvar},");
        }
        out.push('{');
        for (key, value) in &eqn.params {
            let _ = write!(out, "{key}={value};");
        }
        out.push('}');
        for sub in &eqn.sub_jaxprs {
            out.push_str("sub<");
            write_jaxpr(out, sub);
            out.push('>');
        }
        if let Some(bound) = &eqn.bound_subjaxpr {
            out.push_str("call<");
            write_jaxpr(out, &bound.jaxpr);
            out.push_str(">consts=");
            for atom in &bound.const_bindings {
                write_atom(out, atom);
                out.push(',');
            }
            out.push_str("free=");
            for atom in &bound.freevar_bindings {
                write_atom(out, atom);
                out.push(',');
            }
        }
        out.push('|');
    }
}

fn write_var_list(out: &mut String, label: &str, vars: &[VarId]) {
    let _ = write!(out, "{label}=[");
    for var in vars {
        let _ = write!(out, "{var},");
    }
    out.push(']');
}

fn write_atom(out: &mut String, atom: &Atom) {
    match atom {
        Atom::Var(var) => {
            let _ = write!(out, "{var}");
        }
        Atom::Lit(lit) => {
            let _ = write!(out, "{lit}");
        }
    }
}
