//! Lua state backing one session namespace.
//!
//! The interpreter's globals table is the namespace: names bound by one call
//! stay visible to the next. Two adjustments make Lua globals behave like a
//! program namespace:
//! - reading an unbound global raises `name '<x>' is not defined`
//! - all output functions write into an `OutputCapture` instead of the
//!   process's stdio
//!
//! `pcall` and `xpcall` are wrapped so a pending interrupt (budget spent or
//! call cancelled) cannot be swallowed by submitted code.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use mlua::{Function, Lua, MultiValue, Table, Value as LuaValue};
use parking_lot::Mutex;
use thiserror::Error;

use crate::capture::{Channel, OutputCapture};
use crate::value::display;

/// Engine error (faults not attributable to submitted code).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to initialize interpreter: {0}")]
    Init(#[from] mlua::Error),
}

/// Interrupt raised by the watchdog, sticky until the call ends.
#[derive(Debug, Default)]
pub(crate) struct InterruptState {
    cancelled: AtomicBool,
    timed_out: AtomicBool,
}

/// Snapshot of an `InterruptState`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interrupt {
    pub cancelled: bool,
    pub timed_out: bool,
}

impl InterruptState {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn time_out(&self) {
        self.timed_out.store(true, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Interrupt {
        Interrupt {
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        let seen = self.snapshot();
        seen.cancelled || seen.timed_out
    }

    pub(crate) fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
        self.timed_out.store(false, Ordering::Relaxed);
    }

    /// The error raised into Lua while an interrupt is pending.
    pub(crate) fn error(&self) -> Option<mlua::Error> {
        let seen = self.snapshot();
        if seen.cancelled {
            Some(mlua::Error::runtime("execution cancelled"))
        } else if seen.timed_out {
            Some(mlua::Error::runtime("execution budget exceeded"))
        } else {
            None
        }
    }
}

/// One namespace: a Lua state plus its output capture.
pub struct Interpreter {
    lua: Lua,
    capture: Arc<Mutex<OutputCapture>>,
    interrupt: Arc<InterruptState>,
}

impl Interpreter {
    /// Create an empty namespace.
    ///
    /// # Errors
    /// Returns error if the Lua globals cannot be set up.
    pub fn new() -> Result<Self, EngineError> {
        let lua = Lua::new();
        let capture = Arc::new(Mutex::new(OutputCapture::default()));
        let interrupt = Arc::new(InterruptState::default());

        install_output(&lua, &capture)?;
        install_interrupt_guard(&lua, &interrupt)?;
        install_strict_globals(&lua)?;

        Ok(Self {
            lua,
            capture,
            interrupt,
        })
    }

    pub(crate) const fn lua(&self) -> &Lua {
        &self.lua
    }

    pub(crate) fn capture(&self) -> &Mutex<OutputCapture> {
        &self.capture
    }

    pub(crate) const fn interrupt(&self) -> &Arc<InterruptState> {
        &self.interrupt
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("used_memory", &self.lua.used_memory())
            .finish_non_exhaustive()
    }
}

fn install_output(lua: &Lua, capture: &Arc<Mutex<OutputCapture>>) -> mlua::Result<()> {
    let globals = lua.globals();

    let sink = Arc::clone(capture);
    let print = lua.create_function(move |lua, args: MultiValue| {
        let tostring: Function = lua.globals().raw_get("tostring")?;
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(tostring.call::<String>(arg)?);
        }
        let mut line = parts.join("\t");
        line.push('\n');
        sink.lock().write(Channel::Primary, &line);
        Ok(())
    })?;
    globals.set("print", print)?;

    let sink = Arc::clone(capture);
    let warn = lua.create_function(move |_, args: MultiValue| {
        let parts: Vec<String> = args.iter().map(display).collect();
        // "@on" / "@off" style control messages
        if parts.len() == 1 && parts[0].starts_with('@') {
            return Ok(());
        }
        let mut line = parts.concat();
        line.push('\n');
        sink.lock().write(Channel::Diagnostic, &line);
        Ok(())
    })?;
    globals.set("warn", warn)?;

    let io: Table = globals.get("io")?;
    io.set("write", writer(lua, capture, Channel::Primary, false)?)?;
    io.set("stdout", stream_table(lua, capture, Channel::Primary)?)?;
    io.set("stderr", stream_table(lua, capture, Channel::Diagnostic)?)?;

    Ok(())
}

/// A `write` function; method-style writers skip their `self` argument.
fn writer(
    lua: &Lua,
    capture: &Arc<Mutex<OutputCapture>>,
    channel: Channel,
    method: bool,
) -> mlua::Result<Function> {
    let sink = Arc::clone(capture);
    lua.create_function(move |_, args: MultiValue| {
        let skip = usize::from(method);
        let text: String = args.iter().skip(skip).map(display).collect();
        sink.lock().write(channel, &text);
        Ok(())
    })
}

fn stream_table(
    lua: &Lua,
    capture: &Arc<Mutex<OutputCapture>>,
    channel: Channel,
) -> mlua::Result<Table> {
    let stream = lua.create_table()?;
    stream.set("write", writer(lua, capture, channel, true)?)?;
    stream.set("flush", lua.create_function(|_, _: MultiValue| Ok(()))?)?;
    Ok(stream)
}

const GUARD_PROTECTED_CALLS: &str = r"
local check, pcall, xpcall = ...
_G.pcall = function(...) return check(pcall(...)) end
_G.xpcall = function(...) return check(xpcall(...)) end
";

/// Wrap `pcall`/`xpcall` so they re-raise while an interrupt is pending.
fn install_interrupt_guard(lua: &Lua, interrupt: &Arc<InterruptState>) -> mlua::Result<()> {
    let state = Arc::clone(interrupt);
    let check = lua.create_function(move |_, results: MultiValue| match state.error() {
        Some(e) => Err(e),
        None => Ok(results),
    })?;
    let globals = lua.globals();
    let pcall: Function = globals.raw_get("pcall")?;
    let xpcall: Function = globals.raw_get("xpcall")?;
    lua.load(GUARD_PROTECTED_CALLS)
        .set_name("=guard")
        .call::<()>((check, pcall, xpcall))
}

fn install_strict_globals(lua: &Lua) -> mlua::Result<()> {
    let meta = lua.create_table()?;
    let undefined = lua.create_function(|_, (_globals, key): (Table, LuaValue)| {
        Err::<(), _>(mlua::Error::runtime(format!(
            "name '{}' is not defined",
            display(&key)
        )))
    })?;
    meta.set("__index", undefined)?;
    lua.globals().set_metatable(Some(meta));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_is_captured() {
        let interp = Interpreter::new().unwrap();
        interp.lua().load("print('a', 1, nil, true)").exec().unwrap();
        let (primary, diagnostic) = interp.capture().lock().take();
        assert_eq!(primary, "a\t1\tnil\ttrue\n");
        assert!(diagnostic.is_empty());
    }

    #[test]
    fn test_io_streams_are_captured() {
        let interp = Interpreter::new().unwrap();
        interp
            .lua()
            .load("io.write('x', 2); io.stdout:write('y'); io.stderr:write('bad')")
            .exec()
            .unwrap();
        let (primary, diagnostic) = interp.capture().lock().take();
        assert_eq!(primary, "x2y");
        assert_eq!(diagnostic, "bad");
    }

    #[test]
    fn test_warn_goes_to_diagnostic_channel() {
        let interp = Interpreter::new().unwrap();
        interp
            .lua()
            .load("warn('@on'); warn('careful', ' now')")
            .exec()
            .unwrap();
        let (_, diagnostic) = interp.capture().lock().take();
        assert_eq!(diagnostic, "careful now\n");
    }

    #[test]
    fn test_unbound_global_raises() {
        let interp = Interpreter::new().unwrap();
        let err = interp.lua().load("return missing_name").eval::<LuaValue>().unwrap_err();
        assert!(crate::value::format_error(&err).contains("name 'missing_name' is not defined"));
    }

    #[test]
    fn test_protected_calls_pass_through_without_interrupt() {
        let interp = Interpreter::new().unwrap();
        let (ok, msg): (bool, String) = interp
            .lua()
            .load("return pcall(error, 'plain')")
            .eval()
            .unwrap();
        assert!(!ok);
        assert_eq!(msg, "plain");

        let handled: String = interp
            .lua()
            .load("local _, m = xpcall(error, function(e) return 'seen ' .. e end, 'x'); return m")
            .eval()
            .unwrap();
        assert_eq!(handled, "seen x");
    }

    #[test]
    fn test_protected_calls_reraise_pending_interrupt() {
        let interp = Interpreter::new().unwrap();
        interp.interrupt().time_out();
        let err = interp
            .lua()
            .load("pcall(function() end); reached = true")
            .exec()
            .unwrap_err();
        assert!(crate::value::format_error(&err).contains("execution budget exceeded"));

        interp.interrupt().reset();
        let ok: bool = interp.lua().load("return (pcall(function() end))").eval().unwrap();
        assert!(ok);
    }

    #[test]
    fn test_assignment_still_binds() {
        let interp = Interpreter::new().unwrap();
        interp.lua().load("fresh = 5").exec().unwrap();
        let value: i64 = interp.lua().load("return fresh").eval().unwrap();
        assert_eq!(value, 5);
    }
}
