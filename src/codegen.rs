use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::iter;
use std::mem;

use crate::ast::{Expression, Prototype};
use crate::backend::{Backend, BackendError};
use crate::session::Session;

const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId {
    unit: UnitId,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Less,
}

impl BinaryOp {
    fn from_char(op: char) -> Option<Self> {
        match op {
            '+' => Some(BinaryOp::Add),
            '-' => Some(BinaryOp::Sub),
            '*' => Some(BinaryOp::Mul),
            '/' => Some(BinaryOp::Div),
            '<' => Some(BinaryOp::Less),
            _ => None,
        }
    }

    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            // unordered: a NaN on either side compares as less
            BinaryOp::Less => {
                if lhs >= rhs {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Less => "cmplt",
        };
        write!(f, "{}", mnemonic)
    }
}

/// One step of a lowered body. Bodies are postfix sequences run against a
/// value stack: parameters are slots, operators are checked, callees are
/// known to exist with the right arity.
#[derive(Debug, Clone, PartialEq)]
enum Instr {
    Const(f64),
    Param(usize),
    Binary(BinaryOp),
    Call(String, usize),
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Const(value) => write!(f, "const {}", value),
            Instr::Param(slot) => write!(f, "param {}", slot),
            Instr::Binary(op) => write!(f, "{}", op),
            Instr::Call(callee, argc) => write!(f, "call {} {}", callee, argc),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledFunction {
    prototype: Prototype,
    body: Option<Vec<Instr>>,
}

impl fmt::Display for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            None => write!(f, "declare {}", self.prototype),
            Some(code) => {
                write!(f, "define {}", self.prototype)?;
                for instr in code {
                    write!(f, "\n  {}", instr)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct Unit {
    // erased declarations leave a `None` so handles stay valid
    functions: Vec<Option<CompiledFunction>>,
}

impl Unit {
    fn find(&self, name: &str) -> Option<usize> {
        self.functions
            .iter()
            .position(|f| matches!(f, Some(f) if f.prototype.name == name))
    }

    fn definition(&self, name: &str) -> Option<(&Prototype, &[Instr])> {
        self.functions.iter().flatten().find_map(|f| match &f.body {
            Some(body) if f.prototype.name == name => Some((&f.prototype, body.as_slice())),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum HostFunction {
    Unary(fn(f64) -> f64),
    Binary(fn(f64, f64) -> f64),
}

impl HostFunction {
    fn call(self, name: &str, args: &[f64]) -> Result<f64, BackendError> {
        match (self, args) {
            (HostFunction::Unary(f), [x]) => Ok(f(*x)),
            (HostFunction::Binary(f), [x, y]) => Ok(f(*x, *y)),
            (HostFunction::Unary(_), _) => {
                Err(BackendError::InvalidCall(name.to_string(), 1, args.len()))
            }
            (HostFunction::Binary(_), _) => {
                Err(BackendError::InvalidCall(name.to_string(), 2, args.len()))
            }
        }
    }
}

fn host_functions() -> HashMap<&'static str, HostFunction> {
    use HostFunction::{Binary, Unary};

    vec![
        ("sin", Unary(f64::sin)),
        ("cos", Unary(f64::cos)),
        ("tan", Unary(f64::tan)),
        ("asin", Unary(f64::asin)),
        ("acos", Unary(f64::acos)),
        ("atan", Unary(f64::atan)),
        ("sinh", Unary(f64::sinh)),
        ("cosh", Unary(f64::cosh)),
        ("tanh", Unary(f64::tanh)),
        ("exp", Unary(f64::exp)),
        ("log", Unary(f64::ln)),
        ("log10", Unary(f64::log10)),
        ("sqrt", Unary(f64::sqrt)),
        ("fabs", Unary(f64::abs)),
        ("floor", Unary(f64::floor)),
        ("ceil", Unary(f64::ceil)),
        ("round", Unary(f64::round)),
        ("pow", Binary(f64::powf)),
        ("atan2", Binary(f64::atan2)),
        ("fmod", Binary(|x, y| x % y)),
    ]
    .into_iter()
    .collect()
}

fn pop(stack: &mut Vec<f64>) -> Result<f64, BackendError> {
    stack.pop().ok_or(BackendError::MalformedCode)
}

/// Lowers function bodies into postfix code and runs it.
///
/// Units handed off with [`Backend::finalize_unit`] are kept in `units`
/// until released; ids are never reused, so a handle into a released unit
/// stays stale. Calls bind by name when they run, newest live definition
/// first, then the host math library.
pub struct Codegen {
    units: BTreeMap<UnitId, Unit>,
    current: Unit,
    current_id: UnitId,
    host: HashMap<&'static str, HostFunction>,
}

impl Default for Codegen {
    fn default() -> Self {
        Self::new()
    }
}

impl Codegen {
    pub fn new() -> Codegen {
        Codegen {
            units: BTreeMap::new(),
            current: Unit::default(),
            current_id: UnitId(0),
            host: host_functions(),
        }
    }

    fn unit(&self, id: UnitId) -> Option<&Unit> {
        if id == self.current_id {
            Some(&self.current)
        } else {
            self.units.get(&id)
        }
    }

    fn function(&self, id: FunctionId) -> Option<&CompiledFunction> {
        self.unit(id.unit)?.functions.get(id.index)?.as_ref()
    }

    /// whether the open unit or any live finalized unit holds a body for `name`
    fn is_defined(&self, name: &str) -> bool {
        iter::once(&self.current)
            .chain(self.units.values())
            .any(|unit| unit.definition(name).is_some())
    }

    fn compile_expr(
        &mut self,
        expr: &Expression,
        scope: &HashMap<&str, usize>,
        session: &Session,
        code: &mut Vec<Instr>,
    ) -> Result<(), BackendError> {
        match expr {
            Expression::Number(value) => code.push(Instr::Const(*value)),
            Expression::Variable(name) => match scope.get(name.as_str()) {
                Some(slot) => code.push(Instr::Param(*slot)),
                None => return Err(BackendError::UnknownVariable(name.clone())),
            },
            Expression::Binary(op, left, right) => {
                self.compile_expr(left, scope, session, code)?;
                self.compile_expr(right, scope, session, code)?;

                match BinaryOp::from_char(*op) {
                    Some(op) => code.push(Instr::Binary(op)),
                    None => return Err(BackendError::UnknownOperator(*op)),
                }
            }
            Expression::Call(callee, args) => {
                let func = self
                    .get_function(callee, session)?
                    .ok_or_else(|| BackendError::UnknownFunction(callee.clone()))?;
                let arity = self
                    .function(func)
                    .map(|f| f.prototype.args.len())
                    .ok_or(BackendError::StaleHandle)?;

                if arity != args.len() {
                    return Err(BackendError::InvalidCall(callee.clone(), arity, args.len()));
                }

                for arg in args {
                    self.compile_expr(arg, scope, session, code)?;
                }
                code.push(Instr::Call(callee.clone(), args.len()));
            }
        }
        Ok(())
    }

    fn compile_fn(
        &mut self,
        prototype: &Prototype,
        body: &Expression,
        params: &[String],
        session: &Session,
    ) -> Result<Vec<Instr>, BackendError> {
        if self.is_defined(&prototype.name) {
            return Err(BackendError::Redefinition(prototype.name.clone()));
        }
        if params.len() != prototype.args.len() {
            return Err(BackendError::ConflictingDeclaration {
                name: prototype.name.clone(),
                expected: prototype.args.len(),
                found: params.len(),
            });
        }

        // a repeated parameter name shadows the earlier ones
        let scope: HashMap<&str, usize> = params
            .iter()
            .enumerate()
            .map(|(slot, name)| (name.as_str(), slot))
            .collect();

        let mut code = Vec::new();
        self.compile_expr(body, &scope, session, &mut code)?;
        Ok(code)
    }

    fn call(&self, name: &str, args: &[f64], depth: usize) -> Result<f64, BackendError> {
        if depth >= MAX_CALL_DEPTH {
            return Err(BackendError::CallDepthExceeded(name.to_string()));
        }

        let definition = self
            .units
            .values()
            .rev()
            .find_map(|unit| unit.definition(name));
        if let Some((prototype, body)) = definition {
            if prototype.args.len() != args.len() {
                return Err(BackendError::InvalidCall(
                    name.to_string(),
                    prototype.args.len(),
                    args.len(),
                ));
            }
            return self.eval(body, args, depth + 1);
        }

        match self.host.get(name) {
            Some(host) => host.call(name, args),
            None => Err(BackendError::UnresolvedSymbol(name.to_string())),
        }
    }

    fn eval(&self, code: &[Instr], args: &[f64], depth: usize) -> Result<f64, BackendError> {
        let mut stack = Vec::new();

        for instr in code {
            match instr {
                Instr::Const(value) => stack.push(*value),
                Instr::Param(slot) => stack.push(args[*slot]),
                Instr::Binary(op) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(op.apply(lhs, rhs));
                }
                Instr::Call(callee, argc) => {
                    let at = stack
                        .len()
                        .checked_sub(*argc)
                        .ok_or(BackendError::MalformedCode)?;
                    let value = self.call(callee, &stack[at..], depth)?;
                    stack.truncate(at);
                    stack.push(value);
                }
            }
        }

        pop(&mut stack)
    }
}

impl Backend for Codegen {
    type Function = FunctionId;
    type Unit = UnitId;

    fn declare(&mut self, prototype: &Prototype) -> Result<FunctionId, BackendError> {
        let unit = self.current_id;

        if let Some(index) = self.current.find(&prototype.name) {
            let expected = self
                .function(FunctionId { unit, index })
                .map_or(0, |f| f.prototype.args.len());
            if expected != prototype.args.len() {
                return Err(BackendError::ConflictingDeclaration {
                    name: prototype.name.clone(),
                    expected,
                    found: prototype.args.len(),
                });
            }
            return Ok(FunctionId { unit, index });
        }

        self.current.functions.push(Some(CompiledFunction {
            prototype: prototype.clone(),
            body: None,
        }));
        Ok(FunctionId {
            unit,
            index: self.current.functions.len() - 1,
        })
    }

    fn define_body(
        &mut self,
        function: FunctionId,
        body: &Expression,
        params: &[String],
        session: &Session,
    ) -> Result<FunctionId, BackendError> {
        if function.unit != self.current_id {
            return Err(BackendError::StaleHandle);
        }
        let prototype = match self.function(function) {
            Some(f) => f.prototype.clone(),
            None => return Err(BackendError::StaleHandle),
        };

        let result = self.compile_fn(&prototype, body, params, session);

        let slot = &mut self.current.functions[function.index];
        match result {
            Ok(code) => {
                if let Some(f) = slot {
                    f.body = Some(code);
                }
                Ok(function)
            }
            Err(err) => {
                // a failed definition leaves nothing callable behind
                if slot.as_ref().map_or(false, |f| f.body.is_none()) {
                    *slot = None;
                }
                Err(err)
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<FunctionId> {
        self.current.find(name).map(|index| FunctionId {
            unit: self.current_id,
            index,
        })
    }

    fn finalize_unit(&mut self) -> UnitId {
        let id = self.current_id;
        self.units.insert(id, mem::take(&mut self.current));
        self.current_id = UnitId(id.0 + 1);
        id
    }

    fn execute(&self, function: FunctionId) -> Result<f64, BackendError> {
        let func = self.function(function).ok_or(BackendError::StaleHandle)?;
        let name = &func.prototype.name;

        if function.unit == self.current_id {
            return Err(BackendError::NotFinalized(name.clone()));
        }
        if !func.prototype.args.is_empty() {
            return Err(BackendError::InvalidCall(name.clone(), func.prototype.args.len(), 0));
        }

        match &func.body {
            Some(body) => self.eval(body, &[], 0),
            None => self.call(name, &[], 0),
        }
    }

    fn release(&mut self, unit: UnitId) {
        self.units.remove(&unit);
    }

    fn render(&self, function: FunctionId) -> Option<String> {
        self.function(function).map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ANONYMOUS_FUNCTION;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Expression {
        Parser::for_source(source)
            .parse_expression(&Session::default())
            .unwrap()
    }

    fn args(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn define(
        codegen: &mut Codegen,
        session: &mut Session,
        name: &str,
        params: &[&str],
        body: &str,
    ) -> Result<FunctionId, BackendError> {
        let prototype = Prototype::new(name, args(params));
        session.register_prototype(prototype.clone());
        let handle = codegen.declare(&prototype)?;
        codegen.define_body(handle, &parse(body), &prototype.args, session)
    }

    fn evaluate(
        codegen: &mut Codegen,
        session: &mut Session,
        body: &str,
    ) -> Result<f64, BackendError> {
        let handle = define(codegen, session, ANONYMOUS_FUNCTION, &[], body)?;
        let unit = codegen.finalize_unit();
        let result = codegen.execute(handle);
        codegen.release(unit);
        result
    }

    #[test]
    fn codegen_works() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        define(&mut codegen, &mut session, "thing", &["x"], "sin(x) * x")
            .expect_err("sin is not declared yet");

        session.register_prototype(Prototype::new("sin", args(&["x"])));
        define(&mut codegen, &mut session, "thing", &["x"], "sin(x) * x").unwrap();
        codegen.finalize_unit();

        assert_eq!(evaluate(&mut codegen, &mut session, "thing(0) + 3*2"), Ok(6.0));
    }

    #[test]
    fn operators_evaluate() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        assert_eq!(evaluate(&mut codegen, &mut session, "3+4*2"), Ok(11.0));
        assert_eq!(evaluate(&mut codegen, &mut session, "8-4-2"), Ok(2.0));
        assert_eq!(evaluate(&mut codegen, &mut session, "1<2"), Ok(1.0));
        assert_eq!(evaluate(&mut codegen, &mut session, "2<1"), Ok(0.0));
    }

    #[test]
    fn nan_compares_less() {
        assert_eq!(BinaryOp::Less.apply(f64::NAN, 1.0), 1.0);
        assert_eq!(BinaryOp::Less.apply(1.0, f64::NAN), 1.0);
    }

    #[test]
    fn render_lists_postfix_code() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        session.register_prototype(Prototype::new("sin", args(&["x"])));
        let handle =
            define(&mut codegen, &mut session, "f", &["a", "b"], "a + sin(b) * 2").unwrap();

        assert_eq!(
            codegen.render(handle).unwrap(),
            "define f(a b)\n  param 0\n  param 1\n  call sin 1\n  const 2\n  mul\n  add"
        );
        let sin = codegen.lookup("sin").unwrap();
        assert_eq!(codegen.render(sin).unwrap(), "declare sin(x)");
    }

    #[test]
    fn unknown_names_are_rejected() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        assert_eq!(
            evaluate(&mut codegen, &mut session, "y"),
            Err(BackendError::UnknownVariable("y".to_string()))
        );
        assert_eq!(
            evaluate(&mut codegen, &mut session, "nope(1)"),
            Err(BackendError::UnknownFunction("nope".to_string()))
        );
        // the failed anonymous declaration is erased
        assert_eq!(codegen.lookup(ANONYMOUS_FUNCTION), None);
    }

    #[test]
    fn call_arity_is_checked() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        define(&mut codegen, &mut session, "f", &["x"], "x").unwrap();
        codegen.finalize_unit();
        assert_eq!(
            evaluate(&mut codegen, &mut session, "f(1, 2)"),
            Err(BackendError::InvalidCall("f".to_string(), 1, 2))
        );
    }

    #[test]
    fn invalid_operator_is_rejected() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        session.set_precedence('%', 40).unwrap();
        let body = Parser::for_source("5%2").parse_expression(&session).unwrap();

        let handle = codegen.declare(&Prototype::anonymous()).unwrap();
        assert_eq!(
            codegen.define_body(handle, &body, &[], &session),
            Err(BackendError::UnknownOperator('%'))
        );
    }

    #[test]
    fn redefinition_is_rejected() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        define(&mut codegen, &mut session, "f", &["x"], "x").unwrap();
        codegen.finalize_unit();

        assert_eq!(
            define(&mut codegen, &mut session, "f", &["x"], "x+1"),
            Err(BackendError::Redefinition("f".to_string()))
        );
        assert_eq!(evaluate(&mut codegen, &mut session, "f(5)"), Ok(5.0));
    }

    #[test]
    fn lookup_only_sees_open_unit() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        let handle = define(&mut codegen, &mut session, "f", &[], "1").unwrap();
        assert_eq!(codegen.lookup("f"), Some(handle));
        assert_eq!(codegen.execute(handle), Err(BackendError::NotFinalized("f".to_string())));

        codegen.finalize_unit();
        assert_eq!(codegen.lookup("f"), None);
        assert_eq!(codegen.execute(handle), Ok(1.0));

        // the registry brings it back as a declaration in the new unit
        let redeclared = codegen.get_function("f", &session).unwrap().unwrap();
        assert_eq!(codegen.lookup("f"), Some(redeclared));
    }

    #[test]
    fn released_units_are_gone() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        let handle = define(&mut codegen, &mut session, "g", &[], "2").unwrap();
        let unit = codegen.finalize_unit();
        codegen.release(unit);
        assert_eq!(codegen.execute(handle), Err(BackendError::StaleHandle));
        assert_eq!(
            evaluate(&mut codegen, &mut session, "g()"),
            Err(BackendError::UnresolvedSymbol("g".to_string()))
        );
    }

    #[test]
    fn released_units_do_not_accumulate() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        define(&mut codegen, &mut session, "one", &[], "1").unwrap();
        codegen.finalize_unit();

        for _ in 0..100 {
            assert_eq!(evaluate(&mut codegen, &mut session, "one() + 1"), Ok(2.0));
        }
        assert_eq!(codegen.units.len(), 1);
    }

    #[test]
    fn conflicting_declaration() {
        let mut codegen = Codegen::new();
        codegen.declare(&Prototype::new("h", args(&["a"]))).unwrap();
        assert_eq!(
            codegen.declare(&Prototype::new("h", args(&["a", "b"]))),
            Err(BackendError::ConflictingDeclaration {
                name: "h".to_string(),
                expected: 1,
                found: 2,
            })
        );
    }

    #[test]
    fn host_functions_resolve_externs() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        session.register_prototype(Prototype::new("sqrt", args(&["x"])));
        session.register_prototype(Prototype::new("pow", args(&["x", "y"])));
        assert_eq!(
            evaluate(&mut codegen, &mut session, "sqrt(16) + pow(2, 3)"),
            Ok(12.0)
        );
    }

    #[test]
    fn runaway_recursion_is_an_error() {
        let mut codegen = Codegen::new();
        let mut session = Session::default();
        define(&mut codegen, &mut session, "loop", &["x"], "loop(x + 1)").unwrap();
        codegen.finalize_unit();
        assert_eq!(
            evaluate(&mut codegen, &mut session, "loop(0)"),
            Err(BackendError::CallDepthExceeded("loop".to_string()))
        );
    }
}
