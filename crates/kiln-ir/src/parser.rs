//! Recursive-descent parser for the textual IR.
//!
//! Produces a [`Module`] or a positioned [`ParseError`]. Custom dialect
//! types (`!testlib.custom_arg`) are only accepted when their namespace was
//! registered in the [`DialectRegistry`] seeding the parse.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::attr::{AttrMap, Attribute};
use crate::ir::{BinOp, Function, Module, Op, Param, Region, Value, Visibility};
use crate::lexer::{lex, line_col, Spanned, Token};
use crate::types::IrType;
use kiln_types::DYNAMIC_DIM;

/// Set of dialect namespaces whose types are legal in the parsed module.
///
/// The built-in namespaces (`func`, `arith`, `memref`, `scf`, `async`,
/// `rt`) are always available; everything else must be registered through
/// the compilation options before parsing.
#[derive(Debug, Clone, Default)]
pub struct DialectRegistry {
    custom: FxHashSet<String>,
}

impl DialectRegistry {
    /// Create a registry with only the built-in dialects.
    pub fn new() -> Self {
        DialectRegistry::default()
    }

    /// Allow custom types from the given dialect namespace.
    pub fn register(&mut self, namespace: impl Into<String>) {
        self.custom.insert(namespace.into());
    }

    fn allows(&self, type_name: &str) -> bool {
        let namespace = type_name.split('.').next().unwrap_or(type_name);
        self.custom.contains(namespace)
    }
}

/// A parse failure with a 1-based source position.
#[derive(Debug, Clone, Error)]
#[error("parse error at {line}:{col}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

/// Parse IR text into a module.
pub fn parse_module(source: &str, dialects: &DialectRegistry) -> Result<Module, ParseError> {
    let tokens = lex(source).map_err(|offset| {
        let (line, col) = line_col(source, offset);
        ParseError {
            message: "unexpected character".to_string(),
            line,
            col,
        }
    })?;
    Parser {
        source,
        tokens,
        pos: 0,
        dialects,
    }
    .parse_module()
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    dialects: &'a DialectRegistry,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> ParseError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|t| t.span.start)
            .unwrap_or(self.source.len());
        let (line, col) = line_col(self.source, offset);
        ParseError {
            message: message.into(),
            line,
            col,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ParseError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", token)))
        }
    }

    fn expect_value_name(&mut self) -> Result<String, ParseError> {
        match self.next() {
            Some(Token::ValueName(name)) => Ok(name),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected SSA value name"))
            }
        }
    }

    fn parse_module(mut self) -> Result<Module, ParseError> {
        let mut module = Module::new();
        let wrapped = self.eat(&Token::Module);
        if wrapped {
            self.expect(Token::LBrace)?;
        }
        loop {
            match self.peek() {
                Some(Token::Func) => module.functions.push(self.parse_function()?),
                Some(Token::RBrace) if wrapped => {
                    self.pos += 1;
                    break;
                }
                None if !wrapped => break,
                _ => return Err(self.error("expected `func`")),
            }
        }
        if self.peek().is_some() {
            return Err(self.error("trailing input after module"));
        }
        if module.functions.is_empty() {
            return Err(self.error("module contains no functions"));
        }
        Ok(module)
    }

    fn parse_function(&mut self) -> Result<Function, ParseError> {
        self.expect(Token::Func)?;
        let visibility = if self.eat(&Token::Private) {
            Visibility::Private
        } else {
            Visibility::Public
        };
        let name = match self.next() {
            Some(Token::SymbolName(name)) => name,
            _ => return Err(self.error("expected function symbol name")),
        };

        let mut func = Function::new(name, visibility);
        let mut scope: FxHashMap<String, Value> = FxHashMap::default();

        // Parameter list.
        self.expect(Token::LParen)?;
        if !self.eat(&Token::RParen) {
            loop {
                let param_name = self.expect_value_name()?;
                self.expect(Token::Colon)?;
                let ty = self.parse_type()?;
                let attrs = if self.peek() == Some(&Token::LBrace) {
                    self.parse_attr_map()?
                } else {
                    AttrMap::new()
                };
                let value = func.new_value(ty.clone());
                scope.insert(param_name, value);
                func.params.push(Param { value, ty, attrs });
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma)?;
            }
        }

        // Result types.
        if self.eat(&Token::Arrow) {
            if self.eat(&Token::LParen) {
                if !self.eat(&Token::RParen) {
                    loop {
                        func.results.push(self.parse_type()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
            } else {
                func.results.push(self.parse_type()?);
            }
        }

        // Function attributes.
        if self.eat(&Token::Attributes) {
            func.attrs = self.parse_attr_map()?;
        }

        // Body, if present.
        if self.peek() == Some(&Token::LBrace) {
            let body = self.parse_region(&mut func, &mut scope)?;
            match body.ops.last() {
                Some(Op::Return { .. }) => {}
                _ => return Err(self.error("function body must end in func.return")),
            }
            func.body = Some(body);
        }

        Ok(func)
    }

    fn parse_region(
        &mut self,
        func: &mut Function,
        scope: &mut FxHashMap<String, Value>,
    ) -> Result<Region, ParseError> {
        self.expect(Token::LBrace)?;
        let mut region = Region::default();
        while !self.eat(&Token::RBrace) {
            region.ops.push(self.parse_op(func, scope)?);
        }
        Ok(region)
    }

    fn resolve(
        &self,
        scope: &FxHashMap<String, Value>,
        name: &str,
    ) -> Result<Value, ParseError> {
        scope
            .get(name)
            .copied()
            .ok_or_else(|| self.error(format!("use of undefined value %{}", name)))
    }

    fn parse_operand(
        &mut self,
        scope: &FxHashMap<String, Value>,
    ) -> Result<Value, ParseError> {
        let name = self.expect_value_name()?;
        self.resolve(scope, &name)
    }

    fn parse_operand_list(
        &mut self,
        scope: &FxHashMap<String, Value>,
        open: Token,
        close: Token,
    ) -> Result<Vec<Value>, ParseError> {
        self.expect(open)?;
        let mut operands = Vec::new();
        if self.eat(&close) {
            return Ok(operands);
        }
        loop {
            operands.push(self.parse_operand(scope)?);
            if self.eat(&close) {
                break;
            }
            self.expect(Token::Comma)?;
        }
        Ok(operands)
    }

    fn parse_op(
        &mut self,
        func: &mut Function,
        scope: &mut FxHashMap<String, Value>,
    ) -> Result<Op, ParseError> {
        // Optional result binding: `%r = ...`
        let result_name = if matches!(self.peek(), Some(Token::ValueName(_))) {
            let name = self.expect_value_name()?;
            self.expect(Token::Equals)?;
            Some(name)
        } else {
            None
        };

        let op_name = match self.next() {
            Some(Token::Ident(name)) => name,
            _ => return Err(self.error("expected operation name")),
        };

        let mut bind = |func: &mut Function, ty: IrType, scope: &mut FxHashMap<String, Value>| {
            let value = func.new_value(ty);
            if let Some(name) = &result_name {
                scope.insert(name.clone(), value);
            }
            value
        };

        match op_name.as_str() {
            "arith.constant" => match self.next() {
                Some(Token::IntLit(value)) => {
                    self.expect(Token::Colon)?;
                    let ty = self.parse_type()?;
                    let result = bind(func, ty.clone(), scope);
                    Ok(Op::ConstInt { result, value, ty })
                }
                Some(Token::FloatLit(value)) => {
                    self.expect(Token::Colon)?;
                    let ty = self.parse_type()?;
                    let result = bind(func, ty.clone(), scope);
                    Ok(Op::ConstFloat { result, value, ty })
                }
                _ => Err(self.error("expected constant literal")),
            },
            "rt.constant" => {
                self.expect(Token::Dense)?;
                self.expect(Token::LAngle)?;
                self.expect(Token::LBracket)?;
                let mut values = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        match self.next() {
                            Some(Token::IntLit(v)) => values.push(v),
                            _ => return Err(self.error("expected integer in dense literal")),
                        }
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                self.expect(Token::RAngle)?;
                self.expect(Token::Colon)?;
                let ty = self.parse_type()?;
                let result = bind(func, ty.clone(), scope);
                Ok(Op::ConstDense { result, values, ty })
            }
            "memref.dim" => {
                let source = self.parse_operand(scope)?;
                self.expect(Token::Comma)?;
                let index = match self.next() {
                    Some(Token::IntLit(i)) if i >= 0 => i as usize,
                    _ => return Err(self.error("expected dimension index")),
                };
                if self.eat(&Token::Colon) {
                    self.parse_type()?;
                }
                let result = bind(func, IrType::Index, scope);
                Ok(Op::Dim { result, source, index })
            }
            "memref.load" => {
                let source = self.parse_operand(scope)?;
                let indices =
                    self.parse_operand_list(scope, Token::LBracket, Token::RBracket)?;
                self.expect(Token::Colon)?;
                let ty = self.parse_type()?;
                let dtype = ty
                    .dtype()
                    .ok_or_else(|| self.error("memref.load source must be shaped"))?;
                let result = bind(func, IrType::Scalar(dtype), scope);
                Ok(Op::Load { result, source, indices })
            }
            "memref.store" => {
                let value = self.parse_operand(scope)?;
                self.expect(Token::Comma)?;
                let dest = self.parse_operand(scope)?;
                let indices =
                    self.parse_operand_list(scope, Token::LBracket, Token::RBracket)?;
                if self.eat(&Token::Colon) {
                    self.parse_type()?;
                }
                Ok(Op::Store { value, dest, indices })
            }
            "memref.alloc" => {
                let dyn_sizes = self.parse_operand_list(scope, Token::LParen, Token::RParen)?;
                let attrs = if self.peek() == Some(&Token::LBrace) {
                    self.parse_attr_map()?
                } else {
                    AttrMap::new()
                };
                self.expect(Token::Colon)?;
                let ty = self.parse_type()?;
                let alignment = attrs
                    .get("alignment")
                    .and_then(Attribute::as_int)
                    .map(|a| a as u64);
                let result = bind(func, ty.clone(), scope);
                Ok(Op::Alloc { result, dyn_sizes, ty, alignment })
            }
            "arith.addi" | "arith.subi" | "arith.muli" | "arith.addf" | "arith.subf"
            | "arith.mulf" => {
                let op = match op_name.as_str() {
                    "arith.addi" => BinOp::AddI,
                    "arith.subi" => BinOp::SubI,
                    "arith.muli" => BinOp::MulI,
                    "arith.addf" => BinOp::AddF,
                    "arith.subf" => BinOp::SubF,
                    _ => BinOp::MulF,
                };
                let lhs = self.parse_operand(scope)?;
                self.expect(Token::Comma)?;
                let rhs = self.parse_operand(scope)?;
                self.expect(Token::Colon)?;
                let ty = self.parse_type()?;
                let result = bind(func, ty.clone(), scope);
                Ok(Op::Binary { result, op, lhs, rhs, ty })
            }
            "scf.for" => {
                let iv_name = self.expect_value_name()?;
                self.expect(Token::Equals)?;
                let lower = self.parse_operand(scope)?;
                self.expect(Token::To)?;
                let upper = self.parse_operand(scope)?;
                let iv = func.new_value(IrType::Index);
                // Values defined inside the loop are scoped to its body.
                let mut body_scope = scope.clone();
                body_scope.insert(iv_name, iv);
                let body = self.parse_region(func, &mut body_scope)?;
                Ok(Op::For { iv, lower, upper, body })
            }
            "rt.transpose" => {
                let input = self.parse_operand(scope)?;
                self.expect(Token::Comma)?;
                let perm = self.parse_operand(scope)?;
                self.expect(Token::Colon)?;
                let ty = self.parse_type()?;
                let result = bind(func, ty.clone(), scope);
                Ok(Op::Transpose { result, input, perm, ty })
            }
            "rt.call" => {
                let callee = match self.next() {
                    Some(Token::SymbolName(name)) => name,
                    _ => return Err(self.error("expected callee symbol")),
                };
                let operands = self.parse_operand_list(scope, Token::LParen, Token::RParen)?;
                let attrs = if self.peek() == Some(&Token::LBrace) {
                    self.parse_attr_map()?
                } else {
                    AttrMap::new()
                };
                // Trailing function-type annotation.
                self.expect(Token::Colon)?;
                self.expect(Token::LParen)?;
                if !self.eat(&Token::RParen) {
                    loop {
                        self.parse_type()?;
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                self.expect(Token::Arrow)?;
                let mut result_tys = Vec::new();
                if self.eat(&Token::LParen) {
                    if !self.eat(&Token::RParen) {
                        loop {
                            result_tys.push(self.parse_type()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma)?;
                        }
                    }
                } else {
                    result_tys.push(self.parse_type()?);
                }
                if result_tys.len() > 1 || (result_tys.len() == 1 && result_name.is_none()) {
                    return Err(self.error("rt.call supports at most one bound result"));
                }
                let mut results = Vec::new();
                if let Some(ty) = result_tys.first() {
                    results.push(bind(func, ty.clone(), scope));
                }
                Ok(Op::CustomCall { results, callee, operands, attrs, result_tys })
            }
            "async.ready_token" => {
                let result = bind(func, IrType::AsyncToken, scope);
                Ok(Op::ReadyToken { result })
            }
            "async.ready_value" => {
                let source = self.parse_operand(scope)?;
                self.expect(Token::Colon)?;
                let ty = self.parse_type()?;
                let result = bind(func, ty.clone(), scope);
                Ok(Op::ReadyValue { result, source, ty })
            }
            "func.return" => {
                let mut operands = Vec::new();
                while matches!(self.peek(), Some(Token::ValueName(_))) {
                    operands.push(self.parse_operand(scope)?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                if self.eat(&Token::Colon) {
                    loop {
                        self.parse_type()?;
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                Ok(Op::Return { operands })
            }
            other => Err(self.error(format!("unknown operation `{}`", other))),
        }
    }

    fn parse_attr_map(&mut self) -> Result<AttrMap, ParseError> {
        self.expect(Token::LBrace)?;
        let mut attrs = AttrMap::new();
        if self.eat(&Token::RBrace) {
            return Ok(attrs);
        }
        loop {
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                _ => return Err(self.error("expected attribute name")),
            };
            self.expect(Token::Equals)?;
            let value = self.parse_attr_value()?;
            attrs.set(name, value);
            if self.eat(&Token::RBrace) {
                break;
            }
            self.expect(Token::Comma)?;
        }
        Ok(attrs)
    }

    fn parse_attr_value(&mut self) -> Result<Attribute, ParseError> {
        match self.next() {
            Some(Token::IntLit(value)) => {
                let ty = if self.eat(&Token::Colon) {
                    self.parse_type()?
                } else {
                    IrType::Scalar(kiln_types::DType::I64)
                };
                Ok(Attribute::Int { value, ty })
            }
            Some(Token::FloatLit(value)) => {
                let ty = if self.eat(&Token::Colon) {
                    self.parse_type()?
                } else {
                    IrType::Scalar(kiln_types::DType::F64)
                };
                Ok(Attribute::Float { value, ty })
            }
            Some(Token::StringLit(s)) => Ok(Attribute::Str(s)),
            Some(Token::SymbolName(s)) => Ok(Attribute::Symbol(s)),
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_attr_value()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Attribute::Array(items))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected attribute value"))
            }
        }
    }

    fn parse_type(&mut self) -> Result<IrType, ParseError> {
        match self.next() {
            Some(Token::Ident(name)) => match name.as_str() {
                "index" => Ok(IrType::Index),
                "tensor" => self.parse_shaped(false),
                "memref" => self.parse_shaped(true),
                other => IrType::parse_dtype(other)
                    .map(IrType::Scalar)
                    .ok_or_else(|| self.error(format!("unknown type `{}`", other))),
            },
            Some(Token::BangIdent(name)) => match name.as_str() {
                "async.token" => Ok(IrType::AsyncToken),
                "async.value" => {
                    self.expect(Token::LAngle)?;
                    let inner = self.parse_type()?;
                    self.expect(Token::RAngle)?;
                    Ok(IrType::AsyncValue(Box::new(inner)))
                }
                "rt.kernel_context" => Ok(IrType::KernelContext),
                other => {
                    if self.dialects.allows(other) {
                        Ok(IrType::Custom(other.to_string()))
                    } else {
                        Err(self.error(format!("unregistered dialect type `!{}`", other)))
                    }
                }
            },
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected type"))
            }
        }
    }

    fn parse_shaped(&mut self, memref: bool) -> Result<IrType, ParseError> {
        self.expect(Token::LAngle)?;
        let (dims, dtype) = match self.next() {
            // `2xi32`, `?x?xf32`
            Some(Token::Shape(body)) => {
                let parts: Vec<&str> = body.split('x').collect();
                let dtype_name = parts.last().unwrap();
                let dtype = IrType::parse_dtype(dtype_name)
                    .ok_or_else(|| self.error(format!("unknown element type `{}`", dtype_name)))?;
                let mut dims = Vec::with_capacity(parts.len() - 1);
                for part in &parts[..parts.len() - 1] {
                    if *part == "?" {
                        dims.push(DYNAMIC_DIM);
                    } else {
                        dims.push(part.parse::<i64>().map_err(|_| {
                            self.error(format!("invalid dimension `{}`", part))
                        })?);
                    }
                }
                (Some(dims), dtype)
            }
            // Rank-0: bare element type.
            Some(Token::Ident(name)) => {
                let dtype = IrType::parse_dtype(&name)
                    .ok_or_else(|| self.error(format!("unknown element type `{}`", name)))?;
                (Some(vec![]), dtype)
            }
            // Unranked: `*xf32`.
            Some(Token::UnrankedShape(body)) => {
                let dtype_name = &body[2..];
                let dtype = IrType::parse_dtype(dtype_name)
                    .ok_or_else(|| self.error(format!("unknown element type `{}`", dtype_name)))?;
                (None, dtype)
            }
            _ => return Err(self.error("expected shape")),
        };
        self.expect(Token::RAngle)?;
        Ok(match (dims, memref) {
            (Some(dims), true) => IrType::Memref { dims, dtype },
            (Some(dims), false) => IrType::Tensor { dims, dtype },
            (None, true) => IrType::UnrankedMemref { dtype },
            (None, false) => IrType::UnrankedTensor { dtype },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::DType;

    fn parse(source: &str) -> Module {
        parse_module(source, &DialectRegistry::new()).unwrap()
    }

    #[test]
    fn test_parse_copy_kernel() {
        let module = parse(
            r#"
            func @compute(%arg0: memref<?xf32>, %arg1: memref<?xf32>) {
              %c0 = arith.constant 0 : index
              %0 = memref.load %arg0[%c0] : memref<?xf32>
              memref.store %0, %arg1[%c0] : memref<?xf32>
              func.return
            }
            "#,
        );
        let func = module.lookup("compute").unwrap();
        assert_eq!(func.params.len(), 2);
        assert_eq!(
            func.params[0].ty,
            IrType::Memref {
                dims: vec![DYNAMIC_DIM],
                dtype: DType::F32
            }
        );
        assert_eq!(func.body.as_ref().unwrap().ops.len(), 4);
    }

    #[test]
    fn test_parse_specialization_markers() {
        let module = parse(
            r#"
            func @compute(%p: tensor<2xi32> { specialize.value = "required" }) -> tensor<2xi32> {
              func.return %p : tensor<2xi32>
            }
            "#,
        );
        let func = module.lookup("compute").unwrap();
        assert!(func.requires_specialization());
        assert_eq!(func.results.len(), 1);
    }

    #[test]
    fn test_parse_custom_call_and_dialect_types() {
        let mut dialects = DialectRegistry::new();
        dialects.register("testlib");
        let module = parse_module(
            r#"
            module {
              func private @my.intrinsic(%arg: !testlib.custom_arg)
                attributes { rt.custom_call = "my.intrinsic" }

              func @compute(%arg: !testlib.custom_arg) {
                rt.call @my.intrinsic(%arg) { api_version = 1 : i32 } : (!testlib.custom_arg) -> ()
                func.return
              }
            }
            "#,
            &dialects,
        )
        .unwrap();
        let decl = module.lookup("my.intrinsic").unwrap();
        assert!(decl.is_declaration());
        assert_eq!(decl.visibility, Visibility::Private);
        let targets = module.custom_call_targets();
        assert_eq!(targets.get("my.intrinsic").unwrap(), "my.intrinsic");
    }

    #[test]
    fn test_unregistered_dialect_rejected() {
        let err = parse_module(
            "func @f(%a: !testlib.custom_arg) { func.return }",
            &DialectRegistry::new(),
        )
        .unwrap_err();
        assert!(err.message.contains("unregistered dialect"));
    }

    #[test]
    fn test_parse_loop() {
        let module = parse(
            r#"
            func @loops(%m: memref<?xf32>) {
              %c0 = arith.constant 0 : index
              %d = memref.dim %m, 0
              scf.for %i = %c0 to %d {
                %v = memref.load %m[%i] : memref<?xf32>
                memref.store %v, %m[%i] : memref<?xf32>
              }
              func.return
            }
            "#,
        );
        let func = module.lookup("loops").unwrap();
        let ops = &func.body.as_ref().unwrap().ops;
        assert!(matches!(ops[2], Op::For { .. }));
        if let Op::For { body, .. } = &ops[2] {
            assert_eq!(body.ops.len(), 2);
        }
    }

    #[test]
    fn test_parse_dense_constant() {
        let module = parse(
            r#"
            func @f() -> memref<2xi32> {
              %p = rt.constant dense<[1, 0]> : memref<2xi32>
              func.return %p : memref<2xi32>
            }
            "#,
        );
        let func = module.lookup("f").unwrap();
        match &func.body.as_ref().unwrap().ops[0] {
            Op::ConstDense { values, .. } => assert_eq!(values, &vec![1, 0]),
            other => panic!("expected dense constant, got {:?}", other),
        }
    }

    #[test]
    fn test_undefined_value_error() {
        let err = parse_module(
            "func @f() { memref.store %x, %y[] func.return }",
            &DialectRegistry::new(),
        )
        .unwrap_err();
        assert!(err.message.contains("undefined value"));
    }

    #[test]
    fn test_missing_return_error() {
        let err = parse_module("func @f() { }", &DialectRegistry::new()).unwrap_err();
        assert!(err.message.contains("func.return"));
    }

    #[test]
    fn test_error_position() {
        let err = parse_module("func @f(%a:\n  bogus) { func.return }", &DialectRegistry::new())
            .unwrap_err();
        assert_eq!(err.line, 2);
    }
}
