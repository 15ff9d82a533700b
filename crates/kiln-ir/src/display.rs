//! Textual printing of IR, used by diagnostics and tests.

use std::fmt;

use kiln_types::DYNAMIC_DIM;

use crate::attr::{AttrMap, Attribute};
use crate::ir::{Function, Module, Op, Region, Visibility};
use crate::types::IrType;

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn dims(f: &mut fmt::Formatter<'_>, dims: &[i64]) -> fmt::Result {
            for d in dims {
                if *d == DYNAMIC_DIM {
                    write!(f, "?x")?;
                } else {
                    write!(f, "{}x", d)?;
                }
            }
            Ok(())
        }
        match self {
            IrType::Index => write!(f, "index"),
            IrType::Scalar(dtype) => write!(f, "{}", dtype),
            IrType::Tensor { dims: d, dtype } => {
                write!(f, "tensor<")?;
                dims(f, d)?;
                write!(f, "{}>", dtype)
            }
            IrType::UnrankedTensor { dtype } => write!(f, "tensor<*x{}>", dtype),
            IrType::Memref { dims: d, dtype } => {
                write!(f, "memref<")?;
                dims(f, d)?;
                write!(f, "{}>", dtype)
            }
            IrType::UnrankedMemref { dtype } => write!(f, "memref<*x{}>", dtype),
            IrType::AsyncToken => write!(f, "!async.token"),
            IrType::AsyncValue(inner) => write!(f, "!async.value<{}>", inner),
            IrType::KernelContext => write!(f, "!rt.kernel_context"),
            IrType::Custom(name) => write!(f, "!{}", name),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Int { value, ty } => write!(f, "{} : {}", value, ty),
            Attribute::Float { value, ty } => write!(f, "{} : {}", value, ty),
            Attribute::Str(s) => write!(f, "\"{}\"", s),
            Attribute::Symbol(s) => write!(f, "@{}", s),
            Attribute::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Display for AttrMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, (name, attr)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} = {}", name, attr)?;
        }
        write!(f, " }}")
    }
}

fn write_region(f: &mut fmt::Formatter<'_>, region: &Region, indent: usize) -> fmt::Result {
    for op in &region.ops {
        write_op(f, op, indent)?;
    }
    Ok(())
}

fn write_op(f: &mut fmt::Formatter<'_>, op: &Op, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    match op {
        Op::ConstInt { result, value, ty } => {
            writeln!(f, "{}{} = arith.constant {} : {}", pad, result, value, ty)
        }
        Op::ConstFloat { result, value, ty } => {
            writeln!(f, "{}{} = arith.constant {} : {}", pad, result, value, ty)
        }
        Op::ConstDense { result, values, ty } => {
            write!(f, "{}{} = rt.constant dense<[", pad, result)?;
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", v)?;
            }
            writeln!(f, "]> : {}", ty)
        }
        Op::Dim { result, source, index } => {
            writeln!(f, "{}{} = memref.dim {}, {}", pad, result, source, index)
        }
        Op::Load { result, source, indices } => {
            write!(f, "{}{} = memref.load {}[", pad, result, source)?;
            write_values(f, indices)?;
            writeln!(f, "]")
        }
        Op::Store { value, dest, indices } => {
            write!(f, "{}memref.store {}, {}[", pad, value, dest)?;
            write_values(f, indices)?;
            writeln!(f, "]")
        }
        Op::Alloc { result, dyn_sizes, ty, alignment } => {
            write!(f, "{}{} = memref.alloc(", pad, result)?;
            write_values(f, dyn_sizes)?;
            write!(f, ")")?;
            if let Some(a) = alignment {
                write!(f, " {{ alignment = {} }}", a)?;
            }
            writeln!(f, " : {}", ty)
        }
        Op::Binary { result, op, lhs, rhs, ty } => {
            writeln!(f, "{}{} = {} {}, {} : {}", pad, result, op.name(), lhs, rhs, ty)
        }
        Op::For { iv, lower, upper, body } => {
            writeln!(f, "{}scf.for {} = {} to {} {{", pad, iv, lower, upper)?;
            write_region(f, body, indent + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Op::Transpose { result, input, perm, ty } => {
            writeln!(f, "{}{} = rt.transpose {}, {} : {}", pad, result, input, perm, ty)
        }
        Op::CustomCall { results, callee, operands, attrs, result_tys } => {
            write!(f, "{}", pad)?;
            if let Some(r) = results.first() {
                write!(f, "{} = ", r)?;
            }
            write!(f, "rt.call @{}(", callee)?;
            write_values(f, operands)?;
            write!(f, ")")?;
            if !attrs.is_empty() {
                write!(f, " {}", attrs)?;
            }
            write!(f, " : (...) -> (")?;
            for (i, ty) in result_tys.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", ty)?;
            }
            writeln!(f, ")")
        }
        Op::ReadyToken { result } => writeln!(f, "{}{} = async.ready_token", pad, result),
        Op::ReadyValue { result, source, ty } => {
            writeln!(f, "{}{} = async.ready_value {} : {}", pad, result, source, ty)
        }
        Op::Return { operands } => {
            write!(f, "{}func.return", pad)?;
            if !operands.is_empty() {
                write!(f, " ")?;
                write_values(f, operands)?;
            }
            writeln!(f)
        }
    }
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[crate::ir::Value]) -> fmt::Result {
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", v)?;
    }
    Ok(())
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func ")?;
        if self.visibility == Visibility::Private {
            write!(f, "private ")?;
        }
        write!(f, "@{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", param.value, param.ty)?;
            if !param.attrs.is_empty() {
                write!(f, " {}", param.attrs)?;
            }
        }
        write!(f, ")")?;
        if !self.results.is_empty() {
            write!(f, " -> (")?;
            for (i, ty) in self.results.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", ty)?;
            }
            write!(f, ")")?;
        }
        if !self.attrs.is_empty() {
            write!(f, " attributes {}", self.attrs)?;
        }
        match &self.body {
            Some(body) => {
                writeln!(f, " {{")?;
                write_region(f, body, 1)?;
                write!(f, "}}")
            }
            None => Ok(()),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {{")?;
        for func in &self.functions {
            writeln!(f, "{}", func)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::{parse_module, DialectRegistry};

    #[test]
    fn test_print_parsed_module() {
        let module = parse_module(
            r#"
            func @compute(%arg0: memref<?xf32>) {
              %c0 = arith.constant 0 : index
              %v = memref.load %arg0[%c0] : memref<?xf32>
              memref.store %v, %arg0[%c0] : memref<?xf32>
              func.return
            }
            "#,
            &DialectRegistry::new(),
        )
        .unwrap();
        let printed = module.to_string();
        assert!(printed.contains("func @compute"));
        assert!(printed.contains("memref.load"));
        assert!(printed.contains("memref<?xf32>"));
    }
}
