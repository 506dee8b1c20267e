//! Statement execution and expression evaluation against a namespace.

use std::{
    borrow::Cow,
    sync::Arc,
    time::{Duration, Instant},
};

use mlua::{HookTriggers, Lua, Value as LuaValue, VmState};
use pathview_core::{ExecutionRequest, ExecutionResult, Mode, Outcome};
use tokio_util::sync::CancellationToken;

use crate::interpreter::{EngineError, Interpreter, Interrupt, InterruptState};
use crate::value::{format_error, to_json};

/// How often the watchdog hook runs (every N VM instructions).
pub const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

/// Chunk name shown in error locations (`cell:1: ...`).
const CHUNK_NAME: &str = "=cell";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Treat any diagnostic-channel output as a failed call.
    ///
    /// When disabled, diagnostic output is appended to the primary output.
    pub diagnostics_fail: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            diagnostics_fail: true,
        }
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Wall-clock budget; the call aborts with `Timeout` once it is spent.
    pub budget: Option<Duration>,
    /// Aborts the call with `Cancelled` when triggered.
    pub cancel: Option<CancellationToken>,
}

impl ExecOptions {
    #[must_use]
    pub const fn with_budget(budget: Option<Duration>) -> Self {
        Self {
            budget,
            cancel: None,
        }
    }

    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Runs submitted source against an interpreter.
///
/// Every failure of submitted code is returned as an `Outcome`; nothing
/// raised by the code escapes this boundary.
#[derive(Debug, Clone, Default)]
pub struct ExecutionEngine {
    config: EngineConfig,
}

impl ExecutionEngine {
    #[must_use]
    pub const fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Allocate an empty namespace.
    ///
    /// # Errors
    /// Returns error if the interpreter cannot be created.
    pub fn new_namespace(&self) -> Result<Interpreter, EngineError> {
        Interpreter::new()
    }

    /// Execute `source` as a block of statements.
    #[must_use]
    pub fn run_statements(
        &self,
        ns: &Interpreter,
        source: &str,
        opts: &ExecOptions,
    ) -> ExecutionResult {
        self.execute(ns, Mode::Statements, source, opts)
    }

    /// Evaluate `source` as exactly one expression.
    #[must_use]
    pub fn evaluate_expression(
        &self,
        ns: &Interpreter,
        source: &str,
        opts: &ExecOptions,
    ) -> ExecutionResult {
        self.execute(ns, Mode::Expression, source, opts)
    }

    /// Run a request; the request's budget overrides `opts.budget` when set.
    #[must_use]
    pub fn run_request(
        &self,
        ns: &Interpreter,
        request: &ExecutionRequest,
        opts: &ExecOptions,
    ) -> ExecutionResult {
        let opts = ExecOptions {
            budget: request.budget.or(opts.budget),
            cancel: opts.cancel.clone(),
        };
        self.execute(ns, request.mode, &request.source, &opts)
    }

    fn execute(
        &self,
        ns: &Interpreter,
        mode: Mode,
        source: &str,
        opts: &ExecOptions,
    ) -> ExecutionResult {
        if source.trim().is_empty() {
            return ExecutionResult {
                mode,
                output: String::new(),
                outcome: Outcome::EmptyInput,
            };
        }
        if opts.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return ExecutionResult {
                mode,
                output: String::new(),
                outcome: Outcome::Cancelled,
            };
        }

        ns.capture().lock().clear();
        let lua = ns.lua();

        let code = match mode {
            Mode::Statements => Cow::Borrowed(source),
            // newline keeps a trailing `--` comment from eating the paren
            Mode::Expression => Cow::Owned(format!("return ({source}\n)")),
        };

        let outcome = match lua.load(&*code).set_name(CHUNK_NAME).into_function() {
            Err(e) => Outcome::SyntaxFailure(format_error(&e)),
            Ok(func) => {
                let watchdog = Watchdog::arm(ns, opts);
                let raw = match mode {
                    Mode::Statements => func.call::<()>(()).map(|()| None),
                    Mode::Expression => func.call::<LuaValue>(()).map(Some),
                };
                let interrupt = watchdog.disarm(lua);

                // an interrupt wins even if submitted code caught it
                if interrupt.cancelled {
                    Outcome::Cancelled
                } else if interrupt.timed_out {
                    Outcome::Timeout(opts.budget.unwrap_or_default())
                } else {
                    match raw {
                        Ok(value) => Outcome::Success {
                            value: value.map(|v| to_json(lua, v)),
                        },
                        Err(e) => Outcome::RuntimeFailure(format_error(&e)),
                    }
                }
            }
        };

        let (mut output, diagnostic) = ns.capture().lock().take();
        let outcome = if diagnostic.is_empty() {
            outcome
        } else if self.config.diagnostics_fail {
            match outcome {
                Outcome::Success { .. } => {
                    Outcome::RuntimeFailure(diagnostic.trim_end().to_string())
                }
                Outcome::RuntimeFailure(message) => {
                    Outcome::RuntimeFailure(format!("{message}\n{}", diagnostic.trim_end()))
                }
                failed => {
                    output.push_str(&diagnostic);
                    failed
                }
            }
        } else {
            output.push_str(&diagnostic);
            outcome
        };

        tracing::trace!(?mode, success = outcome.is_success(), "engine call finished");
        ExecutionResult {
            mode,
            output,
            outcome,
        }
    }
}

/// Instruction hook enforcing the budget and cancellation token.
struct Watchdog {
    interrupt: Arc<InterruptState>,
    armed: bool,
}

impl Watchdog {
    fn arm(ns: &Interpreter, opts: &ExecOptions) -> Self {
        let interrupt = Arc::clone(ns.interrupt());
        interrupt.reset();

        if opts.budget.is_none() && opts.cancel.is_none() {
            return Self {
                interrupt,
                armed: false,
            };
        }

        let tripwire = Tripwire {
            interrupt: Arc::clone(&interrupt),
            deadline: opts
                .budget
                .and_then(|budget| Instant::now().checked_add(budget)),
            cancel: opts.cancel.clone(),
        };
        tripwire.install(ns.lua(), HOOK_INSTRUCTION_INTERVAL);

        Self {
            interrupt,
            armed: true,
        }
    }

    fn disarm(self, lua: &Lua) -> Interrupt {
        if self.armed {
            lua.remove_hook();
        }
        let seen = self.interrupt.snapshot();
        self.interrupt.reset();
        seen
    }
}

/// The hook body. Once tripped it fails on every instruction until removed.
#[derive(Clone)]
struct Tripwire {
    interrupt: Arc<InterruptState>,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Tripwire {
    fn install(self, lua: &Lua, every: u32) {
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(every),
            move |lua, _debug| self.check(lua),
        );
    }

    fn check(&self, lua: &Lua) -> mlua::Result<VmState> {
        if !self.interrupt.is_pending() {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                self.interrupt.cancel();
            } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.interrupt.time_out();
            } else {
                return Ok(VmState::Continue);
            }
            self.clone().install(lua, 1);
        }
        Err(self
            .interrupt
            .error()
            .unwrap_or_else(|| mlua::Error::runtime("execution interrupted")))
    }
}
