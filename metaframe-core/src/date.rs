//! Built-in date action library
//!
//! Registered under the `date.` namespace so metadata-declared executions
//! can call into it like any other action. Names keep the camelCase form
//! metadata uses on the wire.
//!
//! All values travel as strings: RFC 3339 timestamps in and out, fixed
//! UTC offsets like `"+02:00"`. Offsets are plain offset arithmetic;
//! there is no IANA zone database behind these handlers.

use serde_json::{Value, json};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::context::{HandlerCall, HandlerRegistry};
use crate::error::EngineError;

/// Register the `date.*` handlers.
pub fn register(registry: &HandlerRegistry) {
    registry.register("date.parseISO", |call| {
        let value = parse_rfc3339(call, "date.parseISO")?;
        format_rfc3339(value, "date.parseISO")
    });
    registry.register("date.toUTC", |call| {
        let value = parse_rfc3339(call, "date.toUTC")?;
        format_rfc3339(value.to_offset(UtcOffset::UTC), "date.toUTC")
    });
    registry.register("date.fromUTC", |call| {
        let value = parse_rfc3339(call, "date.fromUTC")?;
        let offset = parse_offset(call, "date.fromUTC")?;
        format_rfc3339(value.to_offset(offset), "date.fromUTC")
    });
    registry.register("date.getZoneOffset", |call| {
        let offset = parse_offset(call, "date.getZoneOffset")?;
        Ok(json!(offset.whole_minutes()))
    });
    registry.register("date.format", |call| {
        let value = parse_rfc3339(call, "date.format")?;
        let format = str_arg(call, "format", "date.format")?;
        let items = time::format_description::parse(format)
            .map_err(|e| EngineError::handler("date.format", e.to_string()))?;
        value
            .format(&items)
            .map(Value::String)
            .map_err(|e| EngineError::handler("date.format", e.to_string()))
    });
    registry.register("date.parse", |call| {
        let value = str_arg(call, "value", "date.parse")?;
        let format = str_arg(call, "format", "date.parse")?;
        let items = time::format_description::parse(format)
            .map_err(|e| EngineError::handler("date.parse", e.to_string()))?;
        let parsed = PrimitiveDateTime::parse(value, &items)
            .map_err(|e| EngineError::handler("date.parse", e.to_string()))?;
        format_rfc3339(parsed.assume_utc(), "date.parse")
    });
    registry.register("date.timeAt", |call| {
        let value = parse_rfc3339(call, "date.timeAt")?;
        let offset = parse_offset(call, "date.timeAt")?;
        let format = format_description!("[hour]:[minute]:[second]");
        value
            .to_offset(offset)
            .format(&format)
            .map(Value::String)
            .map_err(|e| EngineError::handler("date.timeAt", e.to_string()))
    });
}

fn str_arg<'a>(call: &'a HandlerCall<'_>, key: &str, handler: &str) -> Result<&'a str, EngineError> {
    call.args
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::handler(handler, format!("missing string arg {key:?}")))
}

fn parse_rfc3339(call: &HandlerCall<'_>, handler: &str) -> Result<OffsetDateTime, EngineError> {
    let value = str_arg(call, "value", handler)?;
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|e| EngineError::handler(handler, format!("{value:?}: {e}")))
}

fn parse_offset(call: &HandlerCall<'_>, handler: &str) -> Result<UtcOffset, EngineError> {
    let offset = str_arg(call, "offset", handler)?;
    let format = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(offset, &format)
        .map_err(|e| EngineError::handler(handler, format!("{offset:?}: {e}")))
}

fn format_rfc3339(value: OffsetDateTime, handler: &str) -> Result<Value, EngineError> {
    value
        .format(&Rfc3339)
        .map(Value::String)
        .map_err(|e| EngineError::handler(handler, e.to_string()))
}
