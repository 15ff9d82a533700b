//! Modules, functions, and the tree-structured op set.
//!
//! Ops are stored as an enum with nested regions for structured control
//! flow, so passes walk a tree instead of a CFG. SSA values are dense
//! per-function indices; every value's type is recorded on the function.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::attr::AttrMap;
use crate::types::IrType;

/// SSA value id, unique within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(pub u32);

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Function visibility: private functions are declarations or helpers that
/// never become runtime entrypoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// One function parameter: its SSA value, type, and argument attributes.
#[derive(Debug, Clone)]
pub struct Param {
    pub value: Value,
    pub ty: IrType,
    pub attrs: AttrMap,
}

/// A list of ops forming one straight-line region.
#[derive(Debug, Clone, Default)]
pub struct Region {
    pub ops: Vec<Op>,
}

/// Integer/float binary operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    AddI,
    SubI,
    MulI,
    AddF,
    SubF,
    MulF,
}

impl BinOp {
    /// The `arith.*` op name.
    pub fn name(self) -> &'static str {
        match self {
            BinOp::AddI => "arith.addi",
            BinOp::SubI => "arith.subi",
            BinOp::MulI => "arith.muli",
            BinOp::AddF => "arith.addf",
            BinOp::SubF => "arith.subf",
            BinOp::MulF => "arith.mulf",
        }
    }
}

/// An IR operation.
#[derive(Debug, Clone)]
pub enum Op {
    /// `%r = arith.constant <int> : <ty>`
    ConstInt { result: Value, value: i64, ty: IrType },
    /// `%r = arith.constant <float> : <ty>`
    ConstFloat { result: Value, value: f64, ty: IrType },
    /// `%r = rt.constant dense<[..]> : <shaped ty>`: dense integer data,
    /// produced by value specialization.
    ConstDense {
        result: Value,
        values: Vec<i64>,
        ty: IrType,
    },
    /// `%r = memref.dim %m, <index>`
    Dim {
        result: Value,
        source: Value,
        index: usize,
    },
    /// `%r = memref.load %m[%i, ..]`
    Load {
        result: Value,
        source: Value,
        indices: Vec<Value>,
    },
    /// `memref.store %v, %m[%i, ..]`
    Store {
        value: Value,
        dest: Value,
        indices: Vec<Value>,
    },
    /// `%r = memref.alloc(%d0, ..) : memref<..>`: one operand per dynamic
    /// dimension.
    Alloc {
        result: Value,
        dyn_sizes: Vec<Value>,
        ty: IrType,
        alignment: Option<u64>,
    },
    /// `%r = arith.<op> %a, %b : <ty>`
    Binary {
        result: Value,
        op: BinOp,
        lhs: Value,
        rhs: Value,
        ty: IrType,
    },
    /// `scf.for %iv = %lo to %hi { .. }` with step one.
    For {
        iv: Value,
        lower: Value,
        upper: Value,
        body: Region,
    },
    /// `%r = rt.transpose %input, %perm : <shaped ty>`: high level; the
    /// expansion pass rewrites it into loops once the permutation is a
    /// compile-time constant.
    Transpose {
        result: Value,
        input: Value,
        perm: Value,
        ty: IrType,
    },
    /// `rt.call @callee(%a, ..) { attrs } : (..) -> (..)`: call into a
    /// host intrinsic declared with an `rt.custom_call` attribute.
    CustomCall {
        results: Vec<Value>,
        callee: String,
        operands: Vec<Value>,
        attrs: AttrMap,
        result_tys: Vec<IrType>,
    },
    /// `%r = async.ready_token`: an already-completed async token.
    ReadyToken { result: Value },
    /// `%r = async.ready_value %m : !async.value<..>`: wrap a memref into
    /// an already-completed async value.
    ReadyValue {
        result: Value,
        source: Value,
        ty: IrType,
    },
    /// `func.return %a, ..`
    Return { operands: Vec<Value> },
}

impl Op {
    /// Values defined by this op (loop induction variables included).
    pub fn results(&self) -> Vec<Value> {
        match self {
            Op::ConstInt { result, .. }
            | Op::ConstFloat { result, .. }
            | Op::ConstDense { result, .. }
            | Op::Dim { result, .. }
            | Op::Load { result, .. }
            | Op::Alloc { result, .. }
            | Op::Binary { result, .. }
            | Op::Transpose { result, .. }
            | Op::ReadyToken { result }
            | Op::ReadyValue { result, .. } => vec![*result],
            Op::For { iv, .. } => vec![*iv],
            Op::CustomCall { results, .. } => results.clone(),
            Op::Store { .. } | Op::Return { .. } => vec![],
        }
    }

    /// Values read by this op (not descending into nested regions).
    pub fn operands(&self) -> Vec<Value> {
        match self {
            Op::ConstInt { .. }
            | Op::ConstFloat { .. }
            | Op::ConstDense { .. }
            | Op::ReadyToken { .. } => vec![],
            Op::Dim { source, .. } => vec![*source],
            Op::Load { source, indices, .. } => {
                let mut v = vec![*source];
                v.extend(indices);
                v
            }
            Op::Store { value, dest, indices } => {
                let mut v = vec![*value, *dest];
                v.extend(indices);
                v
            }
            Op::Alloc { dyn_sizes, .. } => dyn_sizes.clone(),
            Op::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Op::For { lower, upper, .. } => vec![*lower, *upper],
            Op::Transpose { input, perm, .. } => vec![*input, *perm],
            Op::CustomCall { operands, .. } => operands.clone(),
            Op::ReadyValue { source, .. } => vec![*source],
            Op::Return { operands } => operands.clone(),
        }
    }

    /// Rewrite every operand through `f` (not descending into regions).
    pub fn map_operands(&mut self, f: &mut dyn FnMut(Value) -> Value) {
        match self {
            Op::ConstInt { .. }
            | Op::ConstFloat { .. }
            | Op::ConstDense { .. }
            | Op::ReadyToken { .. } => {}
            Op::Dim { source, .. } => *source = f(*source),
            Op::Load { source, indices, .. } => {
                *source = f(*source);
                for i in indices {
                    *i = f(*i);
                }
            }
            Op::Store { value, dest, indices } => {
                *value = f(*value);
                *dest = f(*dest);
                for i in indices {
                    *i = f(*i);
                }
            }
            Op::Alloc { dyn_sizes, .. } => {
                for s in dyn_sizes {
                    *s = f(*s);
                }
            }
            Op::Binary { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            Op::For { lower, upper, .. } => {
                *lower = f(*lower);
                *upper = f(*upper);
            }
            Op::Transpose { input, perm, .. } => {
                *input = f(*input);
                *perm = f(*perm);
            }
            Op::CustomCall { operands, .. } => {
                for o in operands {
                    *o = f(*o);
                }
            }
            Op::ReadyValue { source, .. } => *source = f(*source),
            Op::Return { operands } => {
                for o in operands {
                    *o = f(*o);
                }
            }
        }
    }

    /// Nested regions of this op.
    pub fn regions_mut(&mut self) -> Vec<&mut Region> {
        match self {
            Op::For { body, .. } => vec![body],
            _ => vec![],
        }
    }

    /// Nested regions of this op (shared).
    pub fn regions(&self) -> Vec<&Region> {
        match self {
            Op::For { body, .. } => vec![body],
            _ => vec![],
        }
    }
}

/// A function: signature, attributes, and an optional body. Declarations
/// (custom-call callees) have no body.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub visibility: Visibility,
    pub params: Vec<Param>,
    pub results: Vec<IrType>,
    pub attrs: AttrMap,
    pub body: Option<Region>,
    /// Type of every SSA value, indexed by `Value.0`.
    value_types: Vec<IrType>,
}

impl Function {
    /// Create an empty function with no values yet.
    pub fn new(name: impl Into<String>, visibility: Visibility) -> Self {
        Function {
            name: name.into(),
            visibility,
            params: Vec::new(),
            results: Vec::new(),
            attrs: AttrMap::new(),
            body: None,
            value_types: Vec::new(),
        }
    }

    /// Allocate a fresh SSA value of the given type.
    pub fn new_value(&mut self, ty: IrType) -> Value {
        let value = Value(self.value_types.len() as u32);
        self.value_types.push(ty);
        value
    }

    /// Type of an SSA value.
    pub fn value_type(&self, value: Value) -> &IrType {
        &self.value_types[value.0 as usize]
    }

    /// Overwrite the type of an SSA value (used by specialization and
    /// bufferization).
    pub fn set_value_type(&mut self, value: Value, ty: IrType) {
        self.value_types[value.0 as usize] = ty;
    }

    /// Number of SSA values allocated so far.
    pub fn num_values(&self) -> usize {
        self.value_types.len()
    }

    /// Whether this is a declaration without a body.
    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }

    /// Whether any parameter carries a `specialize.shape`/`specialize.value`
    /// `"required"` marker, i.e. the function cannot be compiled without
    /// operand specialization.
    pub fn requires_specialization(&self) -> bool {
        self.params.iter().any(|p| {
            p.attrs.str_is("specialize.shape", "required")
                || p.attrs.str_is("specialize.value", "required")
        })
    }

    /// Walk all ops depth-first, visiting nested regions.
    pub fn walk_ops<'a>(&'a self, f: &mut dyn FnMut(&'a Op)) {
        fn walk<'a>(region: &'a Region, f: &mut dyn FnMut(&'a Op)) {
            for op in &region.ops {
                f(op);
                for nested in op.regions() {
                    walk(nested, f);
                }
            }
        }
        if let Some(body) = &self.body {
            walk(body, f);
        }
    }

    /// Find the defining op of a value, searching nested regions.
    pub fn find_def(&self, value: Value) -> Option<&Op> {
        let mut found = None;
        self.walk_ops(&mut |op| {
            if found.is_none() && op.results().contains(&value) {
                found = Some(op);
            }
        });
        found
    }
}

/// A parsed IR module: an ordered list of functions.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Module::default()
    }

    /// Look up a function by symbol name.
    pub fn lookup(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Look up a function by symbol name, mutably.
    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    /// Map of custom-call callee symbols to their registered runtime names
    /// (the `rt.custom_call` attribute on each declaration).
    pub fn custom_call_targets(&self) -> FxHashMap<String, String> {
        let mut targets = FxHashMap::default();
        for func in &self.functions {
            if let Some(name) = func.attrs.get("rt.custom_call").and_then(|a| a.as_str()) {
                targets.insert(func.name.clone(), name.to_string());
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::Attribute;
    use kiln_types::DType;

    #[test]
    fn test_new_value_types() {
        let mut func = Function::new("f", Visibility::Public);
        let a = func.new_value(IrType::Index);
        let b = func.new_value(IrType::Scalar(DType::F32));
        assert_eq!(a, Value(0));
        assert_eq!(b, Value(1));
        assert_eq!(func.value_type(b), &IrType::Scalar(DType::F32));
    }

    #[test]
    fn test_requires_specialization() {
        let mut func = Function::new("f", Visibility::Public);
        let v = func.new_value(IrType::Tensor {
            dims: vec![2],
            dtype: DType::I32,
        });
        let mut attrs = AttrMap::new();
        attrs.set("specialize.value", Attribute::Str("required".to_string()));
        func.params.push(Param {
            value: v,
            ty: func.value_type(v).clone(),
            attrs,
        });
        assert!(func.requires_specialization());
    }

    #[test]
    fn test_walk_ops_nested() {
        let mut func = Function::new("f", Visibility::Public);
        let lo = func.new_value(IrType::Index);
        let hi = func.new_value(IrType::Index);
        let iv = func.new_value(IrType::Index);
        let inner = func.new_value(IrType::Index);
        func.body = Some(Region {
            ops: vec![
                Op::ConstInt { result: lo, value: 0, ty: IrType::Index },
                Op::ConstInt { result: hi, value: 4, ty: IrType::Index },
                Op::For {
                    iv,
                    lower: lo,
                    upper: hi,
                    body: Region {
                        ops: vec![Op::Binary {
                            result: inner,
                            op: BinOp::AddI,
                            lhs: iv,
                            rhs: iv,
                            ty: IrType::Index,
                        }],
                    },
                },
                Op::Return { operands: vec![] },
            ],
        });

        let mut count = 0;
        func.walk_ops(&mut |_| count += 1);
        assert_eq!(count, 5);

        let def = func.find_def(inner).unwrap();
        assert!(matches!(def, Op::Binary { .. }));
    }

    #[test]
    fn test_custom_call_targets() {
        let mut module = Module::new();
        let mut decl = Function::new("my.intrinsic", Visibility::Private);
        decl.attrs
            .set("rt.custom_call", Attribute::Str("my.runtime.fn".to_string()));
        module.functions.push(decl);

        let targets = module.custom_call_targets();
        assert_eq!(targets.get("my.intrinsic").unwrap(), "my.runtime.fn");
    }
}
