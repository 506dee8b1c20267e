//! Conversion of Lua values into JSON for results and frames.

use mlua::{DeserializeOptions, Lua, LuaSerdeExt, Value as LuaValue};
use serde_json::Value;

/// Convert a Lua value to JSON.
///
/// Functions, threads and userdata nested in a table become `null`, so the
/// rest of the table survives. A value that still cannot be represented (a
/// cyclic table, or a bare function) is reported by its display string.
#[must_use]
pub fn to_json(lua: &Lua, value: LuaValue) -> Value {
    if let LuaValue::Function(_) | LuaValue::Thread(_) | LuaValue::UserData(_) = value {
        return Value::String(display(&value));
    }
    let options = DeserializeOptions::new().deny_unsupported_types(false);
    match lua.from_value_with::<Value>(value.clone(), options) {
        Ok(json) => json,
        Err(e) => {
            tracing::trace!("Value not serializable, using display form: {e}");
            Value::String(display(&value))
        }
    }
}

/// Short display form of a Lua value.
#[must_use]
pub fn display(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_string_lossy().into(),
        LuaValue::Table(_) => "table".to_string(),
        LuaValue::Function(_) => "function".to_string(),
        LuaValue::Thread(_) => "thread".to_string(),
        LuaValue::UserData(_) | LuaValue::LightUserData(_) => "userdata".to_string(),
        LuaValue::Error(e) => format!("error: {e}"),
        _ => "<unknown>".to_string(),
    }
}

/// Flatten an mlua error into the message a client should see.
#[must_use]
pub fn format_error(error: &mlua::Error) -> String {
    match error {
        mlua::Error::SyntaxError { message, .. } | mlua::Error::RuntimeError(message) => {
            message.clone()
        }
        mlua::Error::CallbackError { cause, .. } => format_error(cause),
        _ => error.to_string(),
    }
}
