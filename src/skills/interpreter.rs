//! Action Interpreter
//!
//! Expands a parsed action script into the flat sequence of primitive calls
//! the environment executes. Domain actions are inlined by binding their
//! parameters and walking their bodies; primitives are dispatched through
//! an [`ActionHost`].

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use super::parser::{Call, Expr, Iterable, ParseError, Script, Stmt};
use super::primitives;
use super::registry::ActionRegistry;
use super::types::{ActionDefinition, ActionError, Value};

/// Nesting limit for domain actions calling each other
pub const MAX_DEPTH: usize = 16;

/// Upper bound on primitive calls produced by one script
pub const MAX_CALLS: usize = 10_000;

/// Upper bound on loop iterations plus calls over one expansion
pub const MAX_WORK: usize = 100_000;

/// One primitive invocation with evaluated arguments
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveCall {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

impl PrimitiveCall {
    /// Render as a call expression
    pub fn to_source(&self) -> String {
        let mut parts: Vec<String> = self.args.iter().map(Value::to_source).collect();
        parts.extend(
            self.kwargs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v.to_source())),
        );
        format!("{}({})", self.name, parts.join(", "))
    }
}

/// Dispatch table of the live environment
#[async_trait]
pub trait ActionHost: Send {
    /// Execute one primitive; the error string is reported to the agent as is
    async fn execute(&mut self, call: &PrimitiveCall) -> Result<(), String>;
}

type Scope = HashMap<String, Value>;

pub struct Interpreter<'a> {
    registry: &'a ActionRegistry,
    max_depth: usize,
    max_calls: usize,
    max_work: usize,
}

/// Output and shared work counter of one expansion
#[derive(Default)]
struct Expansion {
    calls: Vec<PrimitiveCall>,
    work: usize,
}

impl Expansion {
    fn tick(&mut self, limit: usize, line: usize) -> Result<(), ActionError> {
        self.work += 1;
        if self.work > limit {
            return Err(limit_error("script does too much work", line));
        }
        Ok(())
    }
}

impl<'a> Interpreter<'a> {
    pub fn new(registry: &'a ActionRegistry) -> Self {
        Self {
            registry,
            max_depth: MAX_DEPTH,
            max_calls: MAX_CALLS,
            max_work: MAX_WORK,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_work(mut self, work: usize) -> Self {
        self.max_work = work;
        self
    }

    /// Flatten a script into primitive calls
    pub fn expand(&self, script: &Script) -> Result<Vec<PrimitiveCall>, ActionError> {
        let mut out = Expansion::default();
        self.exec_block(&script.body, &Scope::new(), 0, &mut out)?;
        Ok(out.calls)
    }

    /// Expand then execute against a host, stopping at the first failure
    pub async fn run(
        &self,
        script: &Script,
        host: &mut dyn ActionHost,
    ) -> Result<usize, ActionError> {
        let calls = self.expand(script)?;
        for (i, call) in calls.iter().enumerate() {
            debug!(call = %call.to_source(), "Executing primitive");
            if let Err(e) = host.execute(call).await {
                debug!(executed = i, error = %e, "Primitive failed");
                return Err(match e.strip_prefix("TimeoutError: ") {
                    Some(rest) => ActionError::Timeout(rest.to_string()),
                    None => ActionError::Environment(e),
                });
            }
        }
        Ok(calls.len())
    }

    fn exec_block(
        &self,
        stmts: &[Stmt],
        scope: &Scope,
        depth: usize,
        out: &mut Expansion,
    ) -> Result<(), ActionError> {
        for stmt in stmts {
            match stmt {
                Stmt::Pass => {}
                Stmt::Call(call) => self.exec_call(call, scope, depth, out)?,
                Stmt::For(each) => {
                    let items = match &each.iter {
                        Iterable::Items(items) => items
                            .iter()
                            .map(|e| eval(e, scope))
                            .collect::<Result<Vec<_>, _>>()?,
                        Iterable::Var(name) => iterate(lookup(name, scope)?)?,
                        Iterable::Range { start, stop } => {
                            let (start, stop) = match (eval(start, scope)?, eval(stop, scope)?) {
                                (Value::Int(a), Value::Int(b)) => (a, b),
                                (a, b) => {
                                    return Err(ActionError::Arity(format!(
                                        "range() arguments must be int, got {} and {}",
                                        a.type_name(),
                                        b.type_name()
                                    )))
                                }
                            };
                            if stop.saturating_sub(start) > self.max_calls as i64 {
                                return Err(limit_error("range is too large", each.pos.line));
                            }
                            (start..stop).map(Value::Int).collect()
                        }
                    };

                    let mut inner = scope.clone();
                    for item in items {
                        out.tick(self.max_work, each.pos.line)?;
                        inner.insert(each.var.clone(), item);
                        self.exec_block(&each.body, &inner, depth, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn exec_call(
        &self,
        call: &Call,
        scope: &Scope,
        depth: usize,
        out: &mut Expansion,
    ) -> Result<(), ActionError> {
        out.tick(self.max_work, call.pos.line)?;
        let args = call
            .args
            .iter()
            .map(|e| eval(e, scope))
            .collect::<Result<Vec<_>, _>>()?;
        let kwargs = call
            .kwargs
            .iter()
            .map(|(k, e)| eval(e, scope).map(|v| (k.clone(), v)))
            .collect::<Result<Vec<_>, _>>()?;

        let def = self
            .registry
            .get(&call.name)
            .or_else(|| primitives::definition(&call.name))
            .ok_or_else(|| {
                ActionError::Syntax(ParseError {
                    line: call.pos.line,
                    column: call.pos.column,
                    message: format!("unknown action '{}'", call.name),
                })
            })?;

        let bound = bind(def, &args, &kwargs)?;

        match def.body {
            None => {
                if out.calls.len() >= self.max_calls {
                    return Err(limit_error("too many primitive calls", call.pos.line));
                }
                out.calls.push(PrimitiveCall {
                    name: call.name.clone(),
                    args,
                    kwargs,
                });
                Ok(())
            }
            Some(ref body) => {
                if depth + 1 > self.max_depth {
                    return Err(limit_error("maximum action recursion depth exceeded", call.pos.line));
                }
                self.exec_block(&body.body, &bound, depth + 1, out)
            }
        }
    }
}

fn limit_error(message: &str, line: usize) -> ActionError {
    ActionError::Syntax(ParseError {
        line,
        column: 1,
        message: message.to_string(),
    })
}

fn eval(expr: &Expr, scope: &Scope) -> Result<Value, ActionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::List(items) => items
            .iter()
            .map(|e| eval(e, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Expr::Var(name) => lookup(name, scope).cloned(),
    }
}

fn lookup<'s>(name: &str, scope: &'s Scope) -> Result<&'s Value, ActionError> {
    scope
        .get(name)
        .ok_or_else(|| ActionError::Arity(format!("name '{}' is not defined", name)))
}

fn iterate(value: &Value) -> Result<Vec<Value>, ActionError> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        other => Err(ActionError::Arity(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

/// Bind call arguments to an action's parameters
pub fn bind(
    def: &ActionDefinition,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<Scope, ActionError> {
    let variadic = def.params.iter().position(|p| p.variadic);
    let positional = &def.params[..variadic.unwrap_or(def.params.len())];

    let mut scope = Scope::new();
    if args.len() > positional.len() {
        match variadic {
            Some(i) => {
                let rest = args[positional.len()..].to_vec();
                scope.insert(def.params[i].name.clone(), Value::List(rest));
            }
            None => {
                return Err(ActionError::Arity(format!(
                    "{}() takes {} positional arguments but {} were given",
                    def.name,
                    positional.len(),
                    args.len()
                )))
            }
        }
    } else if let Some(i) = variadic {
        scope.insert(def.params[i].name.clone(), Value::List(Vec::new()));
    }
    for (param, value) in positional.iter().zip(args) {
        scope.insert(param.name.clone(), value.clone());
    }

    for (key, value) in kwargs {
        let param = def
            .params
            .iter()
            .find(|p| p.name == *key && !p.variadic)
            .ok_or_else(|| {
                ActionError::Arity(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    def.name, key
                ))
            })?;
        if scope.contains_key(&param.name) {
            return Err(ActionError::Arity(format!(
                "{}() got multiple values for argument '{}'",
                def.name, key
            )));
        }
        scope.insert(param.name.clone(), value.clone());
    }

    for param in &def.params {
        if scope.contains_key(&param.name) {
            continue;
        }
        match param.default {
            Some(ref default) => {
                scope.insert(param.name.clone(), default.clone());
            }
            None => {
                return Err(ActionError::Arity(format!(
                    "{}() missing required argument: '{}'",
                    def.name, param.name
                )))
            }
        }
    }
    Ok(scope)
}
