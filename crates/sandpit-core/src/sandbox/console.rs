//! `console` binding

use super::{Host, introspect};
use crate::capture::ConsoleKind;
use crate::value::truncate;
use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{Context, JsArgs, JsResult, JsValue, NativeFunction, js_string};

pub(super) fn install(context: &mut Context, host: &Host) -> JsResult<()> {
    let console = ObjectInitializer::new(context)
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_, args, host, ctx| emit(ConsoleKind::Log, args, host, ctx),
                host.clone(),
            ),
            js_string!("log"),
            0,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_, args, host, ctx| emit(ConsoleKind::Info, args, host, ctx),
                host.clone(),
            ),
            js_string!("info"),
            0,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_, args, host, ctx| emit(ConsoleKind::Warn, args, host, ctx),
                host.clone(),
            ),
            js_string!("warn"),
            0,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_, args, host, ctx| emit(ConsoleKind::Error, args, host, ctx),
                host.clone(),
            ),
            js_string!("error"),
            0,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_, args, host, ctx| emit(ConsoleKind::Log, args, host, ctx),
                host.clone(),
            ),
            js_string!("debug"),
            0,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(table, host.clone()),
            js_string!("table"),
            1,
        )
        .build();

    context.register_global_property(
        js_string!("console"),
        console,
        Attribute::WRITABLE | Attribute::CONFIGURABLE,
    )
}

fn emit(kind: ConsoleKind, args: &[JsValue], host: &Host, context: &mut Context) -> JsResult<JsValue> {
    let content = args
        .iter()
        .map(|arg| render_arg(arg, host, context))
        .collect::<Vec<_>>()
        .join(" ");

    record(kind, content, host);
    Ok(JsValue::undefined())
}

fn table(_: &JsValue, args: &[JsValue], host: &Host, context: &mut Context) -> JsResult<JsValue> {
    let content = format!("Table: {}", render_arg(args.get_or_undefined(0), host, context));
    record(ConsoleKind::Log, content, host);
    Ok(JsValue::undefined())
}

fn record(kind: ConsoleKind, content: String, host: &Host) {
    let content = truncate(content, host.run.config.render.max_chars);
    if !host.run.capture.record(kind, content) {
        tracing::trace!(%kind, "console entry dropped");
    }
}

/// Primitives via ECMAScript ToString, everything else via the value model
fn render_arg(arg: &JsValue, host: &Host, context: &mut Context) -> String {
    if arg.is_object() {
        return introspect(arg, host, context).render(&host.run.config.render);
    }
    if arg.is_symbol() || arg.is_bigint() {
        return arg.display().to_string();
    }
    arg.to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default()
}
